//! Comment queries.

use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::Postgres;

use clipstream_storage::{Comment, NewComment, StorageError};

use crate::error::query_error;

type CommentRow = (i64, i64, i64, i64, String, i64);

fn into_comment(row: CommentRow) -> Comment {
    Comment {
        id: row.0,
        user_id: row.1,
        video_id: row.2,
        parent_id: row.3,
        content: row.4,
        created_at_ms: row.5,
    }
}

/// Inserts a comment row. Does not touch the video's counter.
pub async fn insert<'c, E>(executor: E, comment: NewComment) -> Result<Comment, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: CommentRow = query_as(
        r#"INSERT INTO comments (user_id, video_id, parent_id, content, created_at_ms)
           VALUES ($1, $2, $3, $4, $5)
           RETURNING id, user_id, video_id, parent_id, content, created_at_ms"#,
    )
    .bind(comment.user_id)
    .bind(comment.video_id)
    .bind(comment.parent_id)
    .bind(comment.content)
    .bind(comment.created_at_ms)
    .fetch_one(executor)
    .await
    .map_err(|e| query_error("Failed to create comment", e))?;

    Ok(into_comment(row))
}

/// Reads a comment by id.
pub async fn get<'c, E>(executor: E, id: i64) -> Result<Option<Comment>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: Option<CommentRow> = query_as(
        r#"SELECT id, user_id, video_id, parent_id, content, created_at_ms
           FROM comments
           WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(|e| query_error("Failed to read comment", e))?;

    Ok(row.map(into_comment))
}

/// Comments on a video, newest first.
pub async fn on_video<'c, E>(executor: E, video_id: i64) -> Result<Vec<Comment>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows: Vec<CommentRow> = query_as(
        r#"SELECT id, user_id, video_id, parent_id, content, created_at_ms
           FROM comments
           WHERE video_id = $1
           ORDER BY created_at_ms DESC, id DESC"#,
    )
    .bind(video_id)
    .fetch_all(executor)
    .await
    .map_err(|e| query_error("Failed to list comments", e))?;

    Ok(rows.into_iter().map(into_comment).collect())
}

/// Deletes a comment. Returns `false` if it did not exist.
pub async fn delete<'c, E>(executor: E, id: i64) -> Result<bool, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = query("DELETE FROM comments WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await
        .map_err(|e| query_error("Failed to delete comment", e))?;

    Ok(result.rows_affected() > 0)
}
