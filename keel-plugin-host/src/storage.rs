//! Persisted module storage
//!
//! One directory per module name under a storage root:
//! `<root>/<name>/<name>.wasm`. Only module binaries are ever written here.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// File extension of persisted modules
pub const MODULE_EXTENSION: &str = "wasm";

/// Errors from the persisted-module store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create storage root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to persist module {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to delete module file {path} after {attempts} attempts: {source}")]
    Delete {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Retry schedule for deleting persisted files
#[derive(Debug, Clone)]
pub struct CleanupRetry {
    /// Total delete attempts before giving up
    pub max_attempts: u32,

    /// Delay unit; attempt `n` waits `base_delay * n` before retrying
    pub base_delay: Duration,
}

impl Default for CleanupRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Filesystem layout for persisted modules
#[derive(Debug, Clone)]
pub struct ModuleStorage {
    root: PathBuf,
    retry: CleanupRetry,
}

impl ModuleStorage {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>, retry: CleanupRetry) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StorageError::Root {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root, retry })
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a module with this name is persisted at
    pub fn module_path(&self, name: &str) -> PathBuf {
        self.root
            .join(name)
            .join(format!("{}.{}", name, MODULE_EXTENSION))
    }

    /// Write module bytes to the module's private directory
    ///
    /// Cancellation is only honoured before the write starts; a write in
    /// progress is not rolled back.
    pub async fn persist(
        &self,
        name: &str,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let path = self.module_path(name);
        let write = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&path, bytes).await
        };
        write.await.map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }

    /// Delete a persisted file, retrying on I/O errors
    ///
    /// A file that is already gone counts as deleted. Cancellation is checked
    /// before every attempt and during back-off, and is never retried.
    pub async fn delete_with_retries(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let source = match tokio::fs::remove_file(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => e,
            };

            if attempt == max_attempts {
                return Err(StorageError::Delete {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                });
            }

            tracing::debug!(
                path = %path.display(),
                attempt,
                error = %source,
                "Module file delete failed, retrying"
            );

            let delay = self.retry.base_delay * attempt;
            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(())
    }

    /// Remove a module directory if it is empty, ignoring every error
    pub async fn remove_dir_if_empty(&self, dir: &Path) {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        if let Ok(Some(_)) = entries.next_entry().await {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            tracing::debug!(dir = %dir.display(), error = %e, "Module directory cleanup skipped");
        }
    }
}
