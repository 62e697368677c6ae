//! PostgreSQL implementation of the `DurableStore` trait.

use async_trait::async_trait;
use sqlx_postgres::PgPool;

use clipstream_storage::{
    Comment, CounterColumn, DurableStore, NewComment, NewUser, NewVideo, StorageError,
    StoreTransaction, User, Video,
};

use crate::config::PostgresConfig;
use crate::migrations;
use crate::queries::{comments, relations, users, videos};
use crate::transaction::PostgresTransaction;

/// PostgreSQL durable store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new `PostgresStore` with the given configuration.
    ///
    /// This will create a connection pool and run migrations (if configured).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection pool cannot be created
    /// or if migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StorageError> {
        let pool = config.connect().await?;

        if config.run_migrations {
            migrations::run(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Creates a new `PostgresStore` from an existing connection pool.
    ///
    /// Migrations are not run automatically when using this constructor.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<PostgresTransaction, StorageError> {
        let tx = self.pool.begin().await.map_err(|e| {
            StorageError::transaction_error(format!("Failed to begin transaction: {e}"))
        })?;
        Ok(PostgresTransaction::new(tx))
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StorageError> {
        users::insert(&self.pool, user).await
    }

    async fn create_video(&self, video: NewVideo) -> Result<Video, StorageError> {
        if video.title.trim().is_empty() {
            return Err(StorageError::invalid_row("video title must not be empty"));
        }
        videos::insert(&self.pool, video).await
    }

    async fn create_comment(&self, comment: NewComment) -> Result<Comment, StorageError> {
        let video_id = comment.video_id;
        let mut tx = Box::new(self.begin().await?);

        // The counter update doubles as the existence check for the video.
        let created = async {
            tx.adjust_counter(video_id, CounterColumn::CommentCount, 1)
                .await?;
            tx.insert_comment(comment).await
        }
        .await;

        match created {
            Ok(row) => {
                tx.commit().await?;
                Ok(row)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed after comment insert error");
                }
                Err(e)
            }
        }
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, StorageError> {
        users::get(&self.pool, id).await
    }

    async fn get_video(&self, id: i64) -> Result<Option<Video>, StorageError> {
        videos::get(&self.pool, id).await
    }

    async fn get_comment(&self, id: i64) -> Result<Option<Comment>, StorageError> {
        comments::get(&self.pool, id).await
    }

    async fn list_videos(&self) -> Result<Vec<Video>, StorageError> {
        videos::list(&self.pool).await
    }

    async fn videos_by_author(&self, author_id: i64) -> Result<Vec<Video>, StorageError> {
        videos::by_author(&self.pool, author_id).await
    }

    async fn liked_video_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        relations::liked_video_ids(&self.pool, user_id).await
    }

    async fn followed_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        relations::followed_ids(&self.pool, user_id).await
    }

    async fn follower_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        relations::follower_ids(&self.pool, user_id).await
    }

    async fn comments_on_video(&self, video_id: i64) -> Result<Vec<Comment>, StorageError> {
        comments::on_video(&self.pool, video_id).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        Ok(Box::new(self.begin().await?))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
