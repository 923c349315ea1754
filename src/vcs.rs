/// Revision lookups against the repository's version control system.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::VcsError;

#[async_trait]
pub trait VcsAdapter: Send + Sync {
    /// Current head revision of the working tree at `repo_path`.
    async fn head_revision(&self, repo_path: &Path) -> Result<String, VcsError>;
}

/// `git rev-parse HEAD`, bounded by a timeout.
pub struct GitCli {
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl VcsAdapter for GitCli {
    async fn head_revision(&self, repo_path: &Path) -> Result<String, VcsError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_path)
            .args(["rev-parse", "HEAD"])
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| VcsError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::Command(stderr.trim().to_string()));
        }

        let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if revision.is_empty() {
            return Err(VcsError::Command("empty revision".to_string()));
        }
        debug!(path = %repo_path.display(), revision = %revision, "Resolved head revision");
        Ok(revision)
    }
}

/// Fixed answers per repository path. Paths without an entry fail.
#[derive(Default)]
pub struct StaticVcs {
    heads: Mutex<HashMap<PathBuf, Result<String, String>>>,
}

impl StaticVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_head(self, repo_path: impl Into<PathBuf>, revision: &str) -> Self {
        self.set_head(repo_path, revision);
        self
    }

    pub fn with_error(self, repo_path: impl Into<PathBuf>, message: &str) -> Self {
        if let Ok(mut heads) = self.heads.lock() {
            heads.insert(repo_path.into(), Err(message.to_string()));
        }
        self
    }

    /// Move a repository's head, e.g. to simulate a new commit.
    pub fn set_head(&self, repo_path: impl Into<PathBuf>, revision: &str) {
        if let Ok(mut heads) = self.heads.lock() {
            heads.insert(repo_path.into(), Ok(revision.to_string()));
        }
    }
}

#[async_trait]
impl VcsAdapter for StaticVcs {
    async fn head_revision(&self, repo_path: &Path) -> Result<String, VcsError> {
        let heads = self
            .heads
            .lock()
            .map_err(|_| VcsError::Command("poisoned".to_string()))?;
        match heads.get(repo_path) {
            Some(Ok(rev)) => Ok(rev.clone()),
            Some(Err(msg)) => Err(VcsError::Command(msg.clone())),
            None => Err(VcsError::Command(format!(
                "not a repository: {}",
                repo_path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_vcs() {
        let vcs = StaticVcs::new()
            .with_head("/repo", "abc")
            .with_error("/broken", "fatal: bad object");

        assert_eq!(vcs.head_revision(Path::new("/repo")).await.unwrap(), "abc");
        assert!(vcs.head_revision(Path::new("/broken")).await.is_err());
        assert!(vcs.head_revision(Path::new("/unknown")).await.is_err());

        vcs.set_head("/repo", "def");
        assert_eq!(vcs.head_revision(Path::new("/repo")).await.unwrap(), "def");
    }
}
