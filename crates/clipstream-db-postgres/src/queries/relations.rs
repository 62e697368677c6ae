//! Like and follow relations.

use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::Postgres;

use clipstream_storage::{StorageError, tables};

use crate::error::{is_unique_violation, query_error};

/// Ids of the videos a user has liked.
pub async fn liked_video_ids<'c, E>(executor: E, user_id: i64) -> Result<Vec<i64>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    query_scalar("SELECT video_id FROM likes WHERE user_id = $1 ORDER BY video_id")
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(|e| query_error("Failed to list likes", e))
}

/// Ids of the users a user follows.
pub async fn followed_ids<'c, E>(executor: E, user_id: i64) -> Result<Vec<i64>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    query_scalar("SELECT target_id FROM follows WHERE user_id = $1 ORDER BY target_id")
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(|e| query_error("Failed to list followed users", e))
}

/// Ids of the users following a user.
pub async fn follower_ids<'c, E>(executor: E, user_id: i64) -> Result<Vec<i64>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    query_scalar("SELECT user_id FROM follows WHERE target_id = $1 ORDER BY user_id")
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(|e| query_error("Failed to list followers", e))
}

pub async fn insert_like<'c, E>(executor: E, user_id: i64, video_id: i64) -> Result<(), StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    query("INSERT INTO likes (user_id, video_id) VALUES ($1, $2)")
        .bind(user_id)
        .bind(video_id)
        .execute(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::already_exists(tables::LIKES, format!("user {user_id}, video {video_id}"))
            } else {
                query_error("Failed to insert like", e)
            }
        })?;
    Ok(())
}

pub async fn delete_like<'c, E>(executor: E, user_id: i64, video_id: i64) -> Result<bool, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = query("DELETE FROM likes WHERE user_id = $1 AND video_id = $2")
        .bind(user_id)
        .bind(video_id)
        .execute(executor)
        .await
        .map_err(|e| query_error("Failed to delete like", e))?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_follow<'c, E>(
    executor: E,
    follower_id: i64,
    target_id: i64,
) -> Result<(), StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    query("INSERT INTO follows (user_id, target_id) VALUES ($1, $2)")
        .bind(follower_id)
        .bind(target_id)
        .execute(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::already_exists(tables::FOLLOWS, format!("{follower_id} -> {target_id}"))
            } else {
                query_error("Failed to insert follow", e)
            }
        })?;
    Ok(())
}

pub async fn delete_follow<'c, E>(
    executor: E,
    follower_id: i64,
    target_id: i64,
) -> Result<bool, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = query("DELETE FROM follows WHERE user_id = $1 AND target_id = $2")
        .bind(follower_id)
        .bind(target_id)
        .execute(executor)
        .await
        .map_err(|e| query_error("Failed to delete follow", e))?;
    Ok(result.rows_affected() > 0)
}
