use std::{path::PathBuf, process::Command};

use crate::error::{Error, Result};

/// The versioned origin of the data tree.
pub trait SourceRepository: Send + Sync {
    /// Bring the local data tree up to date.
    fn refresh(&self) -> Result<()>;

    /// An opaque identifier of the current data tree contents.
    fn revision(&self) -> Result<String>;
}

/// A git checkout that is updated with `git pull`.
#[derive(Debug, Clone)]
pub struct GitRepository {
    path: PathBuf,
    remote: String,
    branch: String,
}

impl GitRepository {
    pub fn new(
        path: impl Into<PathBuf>,
        remote: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let command = format!("git {}", args.join(" "));
        tracing::debug!(path = %self.path.display(), %command, "running");

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .output()
            .map_err(|e| Error::SourceSync {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::SourceSync {
                command,
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl SourceRepository for GitRepository {
    fn refresh(&self) -> Result<()> {
        tracing::info!(
            path = %self.path.display(),
            remote = %self.remote,
            branch = %self.branch,
            "pulling data repository"
        );
        self.git(&["pull", &self.remote, &self.branch])?;
        Ok(())
    }

    fn revision(&self) -> Result<String> {
        let head = self.git(&["rev-parse", "HEAD"])?;
        if head.is_empty() {
            return Err(Error::SourceSync {
                command: "git rev-parse HEAD".to_string(),
                reason: "empty output".to_string(),
            });
        }
        Ok(head)
    }
}
