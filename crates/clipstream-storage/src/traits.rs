//! Durable store traits.
//!
//! The durable store owns the authoritative rows. The cache layer reads from it
//! on misses and during set rebuilds, and mutates it only through the synchronous
//! creation paths and the write-back pipeline.

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::StorageError;
use crate::types::{Comment, CounterColumn, NewComment, NewUser, NewVideo, User, Video};

/// The relational store behind the cache.
///
/// Point reads return `Ok(None)` for absent rows so callers can decide whether
/// absence is an error. Filtered reads return ids or rows in the order the cache
/// layer needs them (videos and comments newest first).
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ==================== Creation ====================

    /// Inserts a user and returns the stored row with its generated id.
    async fn create_user(&self, user: NewUser) -> Result<User, StorageError>;

    /// Inserts a video with zeroed counters and returns the stored row.
    async fn create_video(&self, video: NewVideo) -> Result<Video, StorageError>;

    /// Inserts a comment and bumps the video's `comment_count` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the video does not exist.
    async fn create_comment(&self, comment: NewComment) -> Result<Comment, StorageError>;

    // ==================== Point reads ====================

    async fn get_user(&self, id: i64) -> Result<Option<User>, StorageError>;

    async fn get_video(&self, id: i64) -> Result<Option<Video>, StorageError>;

    async fn get_comment(&self, id: i64) -> Result<Option<Comment>, StorageError>;

    // ==================== Filtered reads ====================

    /// Every video, newest publish time first. Used to bootstrap the feed.
    async fn list_videos(&self) -> Result<Vec<Video>, StorageError>;

    /// Videos published by `author_id`, newest first.
    async fn videos_by_author(&self, author_id: i64) -> Result<Vec<Video>, StorageError>;

    /// Ids of the videos `user_id` has liked.
    async fn liked_video_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError>;

    /// Ids of the users `user_id` follows.
    async fn followed_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError>;

    /// Ids of the users following `user_id`.
    async fn follower_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError>;

    /// Comments on `video_id`, newest first.
    async fn comments_on_video(&self, video_id: i64) -> Result<Vec<Comment>, StorageError>;

    // ==================== Transactions ====================

    /// Begins a new transaction.
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StorageError>;

    /// Returns the name of the storage backend.
    fn backend_name(&self) -> &'static str;
}

/// A unit of work against the durable store.
///
/// Nothing written through a transaction is visible to other readers until
/// [`StoreTransaction::commit`] succeeds. Dropping a transaction without
/// committing discards its writes.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    /// Inserts a comment row inside the transaction.
    async fn insert_comment(&mut self, comment: NewComment) -> Result<Comment, StorageError>;

    /// Deletes a comment row. Returns `false` if the row was already gone.
    async fn delete_comment(&mut self, comment_id: i64) -> Result<bool, StorageError>;

    /// Records that `user_id` likes `video_id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the like is already recorded.
    async fn insert_like(&mut self, user_id: i64, video_id: i64) -> Result<(), StorageError>;

    /// Removes a like. Returns `false` if there was nothing to remove.
    async fn delete_like(&mut self, user_id: i64, video_id: i64) -> Result<bool, StorageError>;

    /// Records that `follower_id` follows `target_id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the edge is already recorded.
    async fn insert_follow(&mut self, follower_id: i64, target_id: i64)
    -> Result<(), StorageError>;

    /// Removes a follow edge. Returns `false` if there was nothing to remove.
    async fn delete_follow(
        &mut self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<bool, StorageError>;

    /// Adds `delta` to a counter column of a video inside the transaction.
    async fn adjust_counter(
        &mut self,
        video_id: i64,
        column: CounterColumn,
        delta: i64,
    ) -> Result<(), StorageError>;

    /// Recomputes `like_count` and `comment_count` from the like and comment
    /// rows of `video_id` and returns the updated video.
    ///
    /// The video row is locked first, so a concurrent write-back transaction
    /// is either fully counted or applies on top of the recounted value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the video does not exist.
    async fn recount_counters(&mut self, video_id: i64) -> Result<Video, StorageError>;

    /// Commits all operations in this transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::TransactionError` if the commit fails.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Rolls back all operations in this transaction.
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Runs `f` inside a transaction, committing on `Ok` and rolling back on `Err`.
///
/// ```ignore
/// let removed = with_transaction(store.as_ref(), move |tx| {
///     Box::pin(async move {
///         let removed = tx.delete_like(user_id, video_id).await?;
///         if removed {
///             tx.adjust_counter(video_id, CounterColumn::LikeCount, -1).await?;
///         }
///         Ok(removed)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<T, F>(store: &dyn DurableStore, f: F) -> Result<T, StorageError>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut Box<dyn StoreTransaction>) -> BoxFuture<'t, Result<T, StorageError>>
        + Send,
{
    let mut tx = store.begin_transaction().await?;
    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(
                    error = %rollback_err,
                    original_error = %e,
                    "Rollback failed after transaction error"
                );
            }
            Err(e)
        }
    }
}
