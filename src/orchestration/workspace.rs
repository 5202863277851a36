//! # Request Workspace
//!
//! Per-request working directory `{root}/{request_id}`. The directory belongs to one
//! run for its whole lifetime; the orchestrator's run registry guarantees no second
//! run with the same id exists while it is in use.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::request::is_safe_identifier;

#[async_trait]
pub trait WorkspaceStore: Send + Sync + 'static {
    /// Directory the run writes into
    fn path_for(&self, request_id: &str) -> PathBuf;

    /// Create the directory
    async fn prepare(&self, request_id: &str) -> io::Result<PathBuf>;

    /// Remove the directory and everything in it
    async fn release(&self, request_id: &str) -> io::Result<()>;
}

/// Workspace on the local filesystem
#[derive(Debug, Clone)]
pub struct DirectoryWorkspace {
    root: PathBuf,
    keep_outputs: bool,
}

impl DirectoryWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_outputs: false,
        }
    }

    /// Leave directories in place on release
    pub fn keep_outputs(mut self, keep: bool) -> Self {
        self.keep_outputs = keep;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checked_path(&self, request_id: &str) -> io::Result<PathBuf> {
        if !is_safe_identifier(request_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("request id {:?} is not a safe directory name", request_id),
            ));
        }
        Ok(self.path_for(request_id))
    }
}

#[async_trait]
impl WorkspaceStore for DirectoryWorkspace {
    fn path_for(&self, request_id: &str) -> PathBuf {
        self.root.join(request_id)
    }

    async fn prepare(&self, request_id: &str) -> io::Result<PathBuf> {
        let path = self.checked_path(request_id)?;
        tokio::fs::create_dir_all(&path).await?;
        debug!(request_id = %request_id, path = %path.display(), "Workspace prepared");
        Ok(path)
    }

    async fn release(&self, request_id: &str) -> io::Result<()> {
        let path = self.checked_path(request_id)?;
        if self.keep_outputs {
            debug!(request_id = %request_id, path = %path.display(), "Keeping workspace outputs");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(request_id = %request_id, path = %path.display(), "Workspace released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_and_release() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = DirectoryWorkspace::new(temp.path());

        let path = workspace.prepare("req-1").await.unwrap();
        assert_eq!(path, temp.path().join("req-1"));
        tokio::fs::write(path.join("out.txt"), b"x").await.unwrap();

        workspace.release("req-1").await.unwrap();
        assert!(!path.exists());

        // Releasing twice is fine
        workspace.release("req-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = DirectoryWorkspace::new(temp.path());
        assert!(workspace.prepare("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_keep_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = DirectoryWorkspace::new(temp.path()).keep_outputs(true);
        let path = workspace.prepare("req-2").await.unwrap();
        workspace.release("req-2").await.unwrap();
        assert!(path.exists());
    }
}
