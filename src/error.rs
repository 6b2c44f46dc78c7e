use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("batch submission failed: {0}")]
    Engine(String),

    #[error("operation canceled")]
    Canceled,

    #[error("`{command}` failed: {reason}")]
    SourceSync { command: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("index directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    pub(crate) fn parse(
        path: impl Into<PathBuf>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::Parse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a failed build can simply be retried on the next poll.
    ///
    /// Source and disk failures are not retryable: a source that cannot be
    /// synced cannot be trusted to mark an index current.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Parse { .. } | Error::Engine(_) | Error::Tantivy(_)
        )
    }
}
