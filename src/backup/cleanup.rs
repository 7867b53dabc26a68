use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

use crate::errors::CleanupError;

/// Disposes of a job's local archive once the job is over.
#[async_trait]
pub trait LocalCleanup: Send + Sync {
    async fn remove(&self, local_path: &Path) -> Result<(), CleanupError>;
}

/// Deletes the archive from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveFile;

#[async_trait]
impl LocalCleanup for RemoveFile {
    async fn remove(&self, local_path: &Path) -> Result<(), CleanupError> {
        cleanup(local_path).await
    }
}

/// Removes a local archive. A file that is already gone counts as removed.
pub async fn cleanup(local_path: &Path) -> Result<(), CleanupError> {
    match tokio::fs::remove_file(local_path).await {
        Ok(()) => {
            info!(path = %local_path.display(), "Deleted local backup file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %local_path.display(), "Local backup file already absent");
            Ok(())
        }
        Err(e) => Err(CleanupError {
            path: local_path.to_path_buf(),
            source: e,
        }),
    }
}
