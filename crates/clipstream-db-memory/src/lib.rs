//! In-memory storage backend for the clipstream backend.
//!
//! This crate provides in-memory implementations of the `DurableStore` and
//! `MediaStore` traits from `clipstream-storage`. They back the test suites and
//! local development: every read is counted in [`QueryStats`] so callers can
//! assert how many times the cache layer fell through to the store.
//!
//! # Example
//!
//! ```ignore
//! use clipstream_db_memory::{InMemoryStore, QueryKind};
//! use clipstream_storage::DurableStore;
//!
//! let store = InMemoryStore::new();
//! let video = store.get_video(42).await?;
//! assert_eq!(store.stats().count(QueryKind::GetVideo), 1);
//! ```

mod media;
mod storage;
mod transaction;

pub use clipstream_storage::{DurableStore, MediaStore, StorageError};
pub use media::InMemoryMediaStore;
pub use storage::{InMemoryStore, QueryKind, QueryStats};
pub use transaction::InMemoryTransaction;

/// Creates a shareable in-memory durable store.
pub fn create_durable_store() -> std::sync::Arc<InMemoryStore> {
    std::sync::Arc::new(InMemoryStore::new())
}
