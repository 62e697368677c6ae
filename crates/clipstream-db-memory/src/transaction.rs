//! Transactions for the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::OwnedRwLockWriteGuard;

use clipstream_storage::{
    Comment, CounterColumn, NewComment, StorageError, StoreTransaction, Video, tables,
};

use crate::storage::Tables;

/// A transaction holding the store's write lock.
///
/// Writes go to `staged`; `commit` swaps it into the locked tables, while
/// `rollback` (or drop) leaves them untouched.
pub struct InMemoryTransaction {
    guard: OwnedRwLockWriteGuard<Tables>,
    staged: Tables,
    sequence: Arc<AtomicI64>,
    fail_commit: bool,
}

impl InMemoryTransaction {
    pub(crate) fn new(
        guard: OwnedRwLockWriteGuard<Tables>,
        sequence: Arc<AtomicI64>,
        fail_commit: bool,
    ) -> Self {
        let staged = Tables::clone(&guard);
        Self {
            guard,
            staged,
            sequence,
            fail_commit,
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn insert_comment(&mut self, comment: NewComment) -> Result<Comment, StorageError> {
        let id = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.staged.insert_comment(id, comment)
    }

    async fn delete_comment(&mut self, comment_id: i64) -> Result<bool, StorageError> {
        Ok(self.staged.comments.remove(&comment_id).is_some())
    }

    async fn insert_like(&mut self, user_id: i64, video_id: i64) -> Result<(), StorageError> {
        if !self.staged.likes.insert((user_id, video_id)) {
            return Err(StorageError::already_exists(
                tables::LIKES,
                format!("user {user_id}, video {video_id}"),
            ));
        }
        Ok(())
    }

    async fn delete_like(&mut self, user_id: i64, video_id: i64) -> Result<bool, StorageError> {
        Ok(self.staged.likes.remove(&(user_id, video_id)))
    }

    async fn insert_follow(
        &mut self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<(), StorageError> {
        if !self.staged.follows.insert((follower_id, target_id)) {
            return Err(StorageError::already_exists(
                tables::FOLLOWS,
                format!("{follower_id} -> {target_id}"),
            ));
        }
        Ok(())
    }

    async fn delete_follow(
        &mut self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<bool, StorageError> {
        Ok(self.staged.follows.remove(&(follower_id, target_id)))
    }

    async fn adjust_counter(
        &mut self,
        video_id: i64,
        column: CounterColumn,
        delta: i64,
    ) -> Result<(), StorageError> {
        self.staged.adjust_counter(video_id, column, delta)
    }

    async fn recount_counters(&mut self, video_id: i64) -> Result<Video, StorageError> {
        self.staged.recount_counters(video_id)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        if self.fail_commit {
            return Err(StorageError::transaction_error("commit rejected"));
        }
        let this = *self;
        let mut guard = this.guard;
        *guard = this.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clipstream_storage::DurableStore;

    use crate::InMemoryStore;

    use super::*;

    async fn store_with_video() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .seed_video(Video {
                id: 1,
                author_id: 2,
                title: "clip".into(),
                play_url: String::new(),
                cover_url: String::new(),
                like_count: 3,
                comment_count: 1,
                publish_at_ms: 10,
            })
            .await;
        store
    }

    #[tokio::test]
    async fn test_duplicate_like_in_transaction() {
        let store = store_with_video().await;
        let mut tx = store.begin_transaction().await.unwrap();
        tx.insert_like(5, 1).await.unwrap();
        let err = tx.insert_like(5, 1).await.unwrap_err();
        assert!(err.is_already_exists());
        tx.rollback().await.unwrap();
        assert_eq!(store.like_rows().await, 0);
    }

    #[tokio::test]
    async fn test_delete_reports_missing_rows() {
        let store = store_with_video().await;
        let mut tx = store.begin_transaction().await.unwrap();
        assert!(!tx.delete_like(5, 1).await.unwrap());
        assert!(!tx.delete_follow(5, 6).await.unwrap());
        assert!(!tx.delete_comment(99).await.unwrap());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = store_with_video().await;
        {
            let mut tx = store.begin_transaction().await.unwrap();
            tx.adjust_counter(1, CounterColumn::LikeCount, 10)
                .await
                .unwrap();
        }
        assert_eq!(store.get_video(1).await.unwrap().unwrap().like_count, 3);
    }

    #[tokio::test]
    async fn test_recount_counters_from_rows() {
        let store = store_with_video().await;
        store.seed_like(5, 1).await;
        store.seed_like(6, 1).await;
        store.seed_like(6, 2).await;

        let mut tx = store.begin_transaction().await.unwrap();
        let video = tx.recount_counters(1).await.unwrap();
        assert_eq!((video.like_count, video.comment_count), (2, 0));
        tx.commit().await.unwrap();
        assert_eq!(store.get_video(1).await.unwrap().unwrap().like_count, 2);

        let mut tx = store.begin_transaction().await.unwrap();
        assert!(tx.recount_counters(404).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_comment_insert_and_delete_commit() {
        let store = store_with_video().await;
        let mut tx = store.begin_transaction().await.unwrap();
        let comment = tx
            .insert_comment(NewComment {
                user_id: 5,
                video_id: 1,
                parent_id: 0,
                content: "first".into(),
                created_at_ms: 20,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(store.get_comment(comment.id).await.unwrap().is_some());

        let mut tx = store.begin_transaction().await.unwrap();
        assert!(tx.delete_comment(comment.id).await.unwrap());
        tx.adjust_counter(1, CounterColumn::CommentCount, -1)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(store.get_comment(comment.id).await.unwrap().is_none());
        assert_eq!(store.get_video(1).await.unwrap().unwrap().comment_count, 0);
    }
}
