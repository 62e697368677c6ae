//! In-memory media store.

use async_trait::async_trait;
use dashmap::DashMap;

use clipstream_storage::{MediaStore, StorageError};

/// Keeps uploaded blobs in a concurrent map.
#[derive(Debug)]
pub struct InMemoryMediaStore {
    objects: DashMap<String, Vec<u8>>,
    base_url: String,
}

impl Default for InMemoryMediaStore {
    fn default() -> Self {
        Self::new("memory://media")
    }
}

impl InMemoryMediaStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            objects: DashMap::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Returns a copy of the stored blob.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::media("object key must not be empty"));
        }
        tracing::debug!(key = %key, size = bytes.len(), "Stored media object");
        self.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}
