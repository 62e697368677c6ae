//! # clipstream-storage
//!
//! Storage abstraction layer for the clipstream backend.
//!
//! This crate defines the traits and row types the cache layer relies on. It does
//! not contain any implementations - those are provided by separate crates
//! (`clipstream-db-memory`, `clipstream-db-postgres`).
//!
//! ## Overview
//!
//! - [`DurableStore`]: authoritative rows, filtered reads, counter adjustment and
//!   transactions.
//! - [`StoreTransaction`]: the mutations the write-back pipeline applies.
//! - [`MediaStore`]: opaque blob `put` and URL construction.
//!
//! ## Example
//!
//! ```ignore
//! use clipstream_storage::{CounterColumn, DurableStore, StorageError, with_transaction};
//!
//! async fn record_like(store: &dyn DurableStore, user: i64, video: i64) -> Result<(), StorageError> {
//!     with_transaction(store, move |tx| {
//!         Box::pin(async move {
//!             tx.insert_like(user, video).await?;
//!             tx.adjust_counter(video, CounterColumn::LikeCount, 1).await
//!         })
//!     })
//!     .await
//! }
//! ```

mod error;
mod media;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use media::{MediaKind, MediaStore};
pub use traits::{DurableStore, StoreTransaction, with_transaction};
pub use types::{
    Comment, CounterColumn, NewComment, NewUser, NewVideo, User, Video, now_millis, tables,
};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared durable store trait object.
pub type DynDurableStore = std::sync::Arc<dyn DurableStore>;

/// Shared media store trait object.
pub type DynMediaStore = std::sync::Arc<dyn MediaStore>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use clipstream_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::media::{MediaKind, MediaStore};
    pub use crate::traits::{DurableStore, StoreTransaction, with_transaction};
    pub use crate::types::{Comment, CounterColumn, NewComment, NewUser, NewVideo, User, Video};
    pub use crate::{DynDurableStore, DynMediaStore, StorageResult};
}
