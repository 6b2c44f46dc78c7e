use std::path::{Path, PathBuf};

use crate::{error::Result, tantivy_index::SearchIndex};

/// An open index together with the directory it lives in.
///
/// Ownership moves from the build to whoever receives it on the handoff
/// channel; that owner must eventually [`close`](Self::close) or
/// [`destroy`](Self::destroy) it.
#[derive(Debug)]
pub struct IndexHandle {
    index: SearchIndex,
    path: Option<PathBuf>,
}

impl IndexHandle {
    /// Open the index in `path`, creating an empty one if none exists.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let index = if SearchIndex::exists(path)? {
            SearchIndex::open(path)?
        } else {
            SearchIndex::create(path)?
        };
        Ok(Self {
            index,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing on-disk index.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            index: SearchIndex::open(path)?,
            path: Some(path.to_path_buf()),
        })
    }

    /// An empty index with no backing directory.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            index: SearchIndex::open_in_ram()?,
            path: None,
        })
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Release the engine handle, leaving the directory on disk.
    pub fn close(self) {
        drop(self.index);
    }

    /// Close the index and remove its directory.
    ///
    /// A handle without a path is only closed.
    pub fn destroy(self) -> Result<()> {
        let IndexHandle { index, path } = self;
        drop(index);

        if let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) {
            tracing::debug!(path = %path.display(), "destroying index");
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}
