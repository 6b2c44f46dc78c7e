use serde::{Deserialize, Serialize};

use crate::{error::Result, index_dir::IndexDir};

/// Records which source revision the current on-disk build was made from.
///
/// Stored as JSON in `<index root>/.state`.
///
/// # Examples
///
/// ```
/// use talksearch::state::IndexState;
///
/// let state = IndexState {
///     index: "0f5c2a".to_string(),
///     revision: "4b825dc642cb6eb9a060e54bf8d69288fbee4904".to_string(),
/// };
/// assert!(state.is_current("4b825dc642cb6eb9a060e54bf8d69288fbee4904"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    /// Name of the build directory under the index root.
    pub index: String,
    /// Source revision the build was made from.
    pub revision: String,
}

impl IndexState {
    pub fn is_current(&self, revision: &str) -> bool {
        self.revision == revision
    }
}

/// Read the state marker. `Ok(None)` means no build has completed yet.
pub fn read_state(dir: &IndexDir) -> Result<Option<IndexState>> {
    let path = dir.state_file();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Replace the state marker.
///
/// Call only after the build it names has been committed. The file is
/// written to a temporary sibling and renamed into place, so readers see
/// either the old or the new state.
pub fn write_state(dir: &IndexDir, state: &IndexState) -> Result<()> {
    let path = dir.state_file();
    let bytes = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
