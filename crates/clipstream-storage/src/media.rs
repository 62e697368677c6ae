//! Media store abstraction.
//!
//! Media blobs (video files and cover images) live outside the relational store.
//! The cache layer only needs to upload a blob and turn its key into a public URL.

use async_trait::async_trait;

use crate::error::StorageError;

/// Kind of media blob, which decides the object key layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Cover,
}

impl MediaKind {
    /// Key prefix for this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Cover => "cover",
        }
    }

    /// File extension used for objects of this kind.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Cover => "jpg",
        }
    }

    /// Builds an object key like `video/<name>.mp4`.
    pub fn object_key(self, name: &str) -> String {
        format!("{}/{}.{}", self.prefix(), name, self.extension())
    }
}

/// Opaque blob storage addressed by key.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Returns the public URL for `key`. Does not check that the object exists.
    fn url_for(&self, key: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_follow_kind_layout() {
        assert_eq!(MediaKind::Video.object_key("abc"), "video/abc.mp4");
        assert_eq!(MediaKind::Cover.object_key("abc"), "cover/abc.jpg");
    }
}
