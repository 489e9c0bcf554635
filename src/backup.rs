//! In-memory snapshots of file contents taken before the first write.
//!
//! The store is owned by the router and passed to the write controller; a
//! snapshot survives for the lifetime of the process and is consumed by an
//! explicit restore.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("no backup stored for {0}")]
    NotFound(String),
}

/// Map from absolute path to the file's pre-modification contents.
#[derive(Debug, Clone, Default)]
pub struct BackupStore {
    entries: Arc<RwLock<HashMap<PathBuf, String>>>,
}

impl BackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the prior contents of `path`. The first snapshot per path
    /// wins; later writes to an already-tracked path keep the original.
    pub async fn store(&self, path: &Path, contents: String) {
        let mut entries = self.entries.write().await;
        entries.entry(path.to_path_buf()).or_insert(contents);
    }

    pub async fn get(&self, path: &Path) -> Result<String, BackupError> {
        let entries = self.entries.read().await;
        entries
            .get(path)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(path.display().to_string()))
    }

    pub async fn has(&self, path: &Path) -> bool {
        self.entries.read().await.contains_key(path)
    }

    pub async fn clear(&self, path: &Path) {
        self.entries.write().await.remove(path);
    }

    /// Remove and return the snapshot for `path`, used by restore.
    pub async fn take(&self, path: &Path) -> Result<String, BackupError> {
        let mut entries = self.entries.write().await;
        entries
            .remove(path)
            .ok_or_else(|| BackupError::NotFound(path.display().to_string()))
    }
}
