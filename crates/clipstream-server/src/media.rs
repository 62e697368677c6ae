//! Media store backed by a local directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use clipstream_storage::{MediaStore, StorageError};
use tokio::fs;

use crate::config::MediaConfig;

/// Writes blobs under `root_dir/<key>` and serves them from `public_base_url`.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
    base_url: String,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(cfg: &MediaConfig) -> Self {
        Self::new(&cfg.root_dir, &cfg.public_base_url)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `key` inside the root. Keys must be relative and may not
    /// climb out of it.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::media(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::media(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let size = bytes.len();
        fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::media(format!("failed to write {}: {e}", path.display())))?;
        tracing::debug!(key = %key, size, "Stored media object");
        Ok(())
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}
