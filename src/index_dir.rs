use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const STATE_FILE: &str = ".state";

/// The directory holding every on-disk build plus the `.state` marker.
#[derive(Debug, Clone)]
pub struct IndexDir {
    root: PathBuf,
}

impl IndexDir {
    /// Resolve the index root from, in order of priority:
    /// 1. An explicit path (from --index-path)
    /// 2. The TALKSEARCH_INDEX_PATH environment variable
    /// 3. The XDG data directory (~/.local/share/talksearch/index)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("TALKSEARCH_INDEX_PATH") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("talksearch")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
                .join("index")
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    /// Directory of the build named `id`. Not created.
    pub fn build_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Names of all build directories, sorted. Dot-prefixed entries are
    /// not builds.
    pub fn builds(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove every build directory except `keep`. Returns how many were
    /// removed.
    pub fn prune_builds(&self, keep: &str) -> Result<usize> {
        let mut removed = 0;
        for name in self.builds()? {
            if name == keep {
                continue;
            }
            let path = self.build_dir(&name);
            tracing::info!(path = %path.display(), "removing stale build");
            std::fs::remove_dir_all(&path)?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.state_file(), tmp.path().join(".state"));
        assert_eq!(dir.build_dir("abc"), tmp.path().join("abc"));
    }

    #[test]
    fn root_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested").join("index");
        let dir = IndexDir::resolve(Some(&root)).unwrap();

        assert!(dir.root().is_dir());
    }

    #[test]
    fn builds_skip_files_and_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::resolve(Some(tmp.path())).unwrap();
        std::fs::create_dir(dir.build_dir("b")).unwrap();
        std::fs::create_dir(dir.build_dir("a")).unwrap();
        std::fs::create_dir(dir.build_dir(".tmp")).unwrap();
        std::fs::write(dir.state_file(), "{}").unwrap();

        assert_eq!(dir.builds().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn prune_keeps_the_named_build() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::resolve(Some(tmp.path())).unwrap();
        for name in ["old1", "current", "old2"] {
            std::fs::create_dir(dir.build_dir(name)).unwrap();
        }
        std::fs::write(dir.state_file(), "{}").unwrap();

        assert_eq!(dir.prune_builds("current").unwrap(), 2);
        assert_eq!(dir.builds().unwrap(), vec!["current"]);
        assert!(dir.state_file().exists());
    }
}
