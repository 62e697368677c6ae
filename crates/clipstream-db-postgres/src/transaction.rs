//! PostgreSQL transactions for the write-back pipeline and creation paths.

use async_trait::async_trait;
use sqlx_postgres::{PgConnection, PgTransaction};
use tokio::sync::Mutex;

use clipstream_storage::{
    Comment, CounterColumn, NewComment, StorageError, StoreTransaction, Video,
};

use crate::queries::{comments, relations, videos};

/// Wraps an sqlx transaction. Rolls back on drop if not explicitly committed.
///
/// The `Mutex` provides the `Sync` bound the trait object needs; every method
/// takes `&mut self`, so it is only ever accessed through `get_mut`.
pub struct PostgresTransaction {
    tx: Mutex<Option<Box<PgTransaction<'static>>>>,
}

impl PostgresTransaction {
    /// Creates a new PostgreSQL transaction.
    pub fn new(tx: PgTransaction<'static>) -> Self {
        Self {
            tx: Mutex::new(Some(Box::new(tx))),
        }
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StorageError> {
        let tx = self.tx.get_mut().as_deref_mut().ok_or_else(|| {
            StorageError::transaction_error(
                "Transaction already completed (committed or rolled back)",
            )
        })?;
        Ok(&mut **tx)
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn insert_comment(&mut self, comment: NewComment) -> Result<Comment, StorageError> {
        comments::insert(self.conn()?, comment).await
    }

    async fn delete_comment(&mut self, comment_id: i64) -> Result<bool, StorageError> {
        comments::delete(self.conn()?, comment_id).await
    }

    async fn insert_like(&mut self, user_id: i64, video_id: i64) -> Result<(), StorageError> {
        relations::insert_like(self.conn()?, user_id, video_id).await
    }

    async fn delete_like(&mut self, user_id: i64, video_id: i64) -> Result<bool, StorageError> {
        relations::delete_like(self.conn()?, user_id, video_id).await
    }

    async fn insert_follow(
        &mut self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<(), StorageError> {
        relations::insert_follow(self.conn()?, follower_id, target_id).await
    }

    async fn delete_follow(
        &mut self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<bool, StorageError> {
        relations::delete_follow(self.conn()?, follower_id, target_id).await
    }

    async fn adjust_counter(
        &mut self,
        video_id: i64,
        column: CounterColumn,
        delta: i64,
    ) -> Result<(), StorageError> {
        videos::adjust_counter(self.conn()?, video_id, column, delta).await
    }

    async fn recount_counters(&mut self, video_id: i64) -> Result<Video, StorageError> {
        videos::recount_counters(self.conn()?, video_id).await
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if let Some(tx) = self.tx.get_mut().take() {
            tx.commit().await.map_err(|e| {
                StorageError::transaction_error(format!("Failed to commit transaction: {e}"))
            })?;
            tracing::debug!("Transaction committed successfully");
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        if let Some(tx) = self.tx.get_mut().take() {
            tx.rollback().await.map_err(|e| {
                StorageError::transaction_error(format!("Failed to rollback transaction: {e}"))
            })?;
            tracing::debug!("Transaction rolled back successfully");
        }
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if self.tx.get_mut().is_some() {
            tracing::warn!(
                "PostgresTransaction dropped without explicit commit/rollback - will auto-rollback"
            );
            // sqlx issues the ROLLBACK from its own Drop impl.
        }
    }
}
