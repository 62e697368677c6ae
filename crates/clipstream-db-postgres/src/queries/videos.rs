//! Video queries, including the counter columns.

use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::{PgConnection, Postgres};

use clipstream_storage::{CounterColumn, NewVideo, StorageError, Video, tables};

use crate::error::query_error;

type VideoRow = (i64, i64, String, String, String, i64, i64, i64);

fn into_video(row: VideoRow) -> Video {
    Video {
        id: row.0,
        author_id: row.1,
        title: row.2,
        play_url: row.3,
        cover_url: row.4,
        like_count: row.5,
        comment_count: row.6,
        publish_at_ms: row.7,
    }
}

/// Inserts a video with zeroed counters.
pub async fn insert<'c, E>(executor: E, video: NewVideo) -> Result<Video, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: VideoRow = query_as(
        r#"INSERT INTO videos (author_id, title, play_url, cover_url, publish_at_ms)
           VALUES ($1, $2, $3, $4, $5)
           RETURNING id, author_id, title, play_url, cover_url,
                     like_count, comment_count, publish_at_ms"#,
    )
    .bind(video.author_id)
    .bind(video.title)
    .bind(video.play_url)
    .bind(video.cover_url)
    .bind(video.publish_at_ms)
    .fetch_one(executor)
    .await
    .map_err(|e| query_error("Failed to create video", e))?;

    Ok(into_video(row))
}

/// Reads a video by id.
pub async fn get<'c, E>(executor: E, id: i64) -> Result<Option<Video>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: Option<VideoRow> = query_as(
        r#"SELECT id, author_id, title, play_url, cover_url,
                  like_count, comment_count, publish_at_ms
           FROM videos
           WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(|e| query_error("Failed to read video", e))?;

    Ok(row.map(into_video))
}

/// Every video, newest first.
pub async fn list<'c, E>(executor: E) -> Result<Vec<Video>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows: Vec<VideoRow> = query_as(
        r#"SELECT id, author_id, title, play_url, cover_url,
                  like_count, comment_count, publish_at_ms
           FROM videos
           ORDER BY publish_at_ms DESC, id DESC"#,
    )
    .fetch_all(executor)
    .await
    .map_err(|e| query_error("Failed to list videos", e))?;

    Ok(rows.into_iter().map(into_video).collect())
}

/// Videos published by one author, newest first.
pub async fn by_author<'c, E>(executor: E, author_id: i64) -> Result<Vec<Video>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows: Vec<VideoRow> = query_as(
        r#"SELECT id, author_id, title, play_url, cover_url,
                  like_count, comment_count, publish_at_ms
           FROM videos
           WHERE author_id = $1
           ORDER BY publish_at_ms DESC, id DESC"#,
    )
    .bind(author_id)
    .fetch_all(executor)
    .await
    .map_err(|e| query_error("Failed to list videos by author", e))?;

    Ok(rows.into_iter().map(into_video).collect())
}

/// Adds `delta` to a counter column.
///
/// The column name comes from a closed enum, never from input.
pub async fn adjust_counter<'c, E>(
    executor: E,
    video_id: i64,
    column: CounterColumn,
    delta: i64,
) -> Result<(), StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = match column {
        CounterColumn::LikeCount => "UPDATE videos SET like_count = like_count + $2 WHERE id = $1",
        CounterColumn::CommentCount => {
            "UPDATE videos SET comment_count = comment_count + $2 WHERE id = $1"
        }
    };

    let result = query(sql)
        .bind(video_id)
        .bind(delta)
        .execute(executor)
        .await
        .map_err(|e| query_error("Failed to adjust counter", e))?;

    if result.rows_affected() == 0 {
        return Err(StorageError::not_found(tables::VIDEOS, video_id));
    }
    Ok(())
}

/// Locks the video row, then recomputes both counters from the like and
/// comment rows. Must run inside a transaction so the lock spans the update.
pub async fn recount_counters(
    conn: &mut PgConnection,
    video_id: i64,
) -> Result<Video, StorageError> {
    let locked: Option<(i64,)> = query_as("SELECT id FROM videos WHERE id = $1 FOR UPDATE")
        .bind(video_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_error("Failed to lock video", e))?;
    if locked.is_none() {
        return Err(StorageError::not_found(tables::VIDEOS, video_id));
    }

    // A separate statement, so its snapshot sees rows committed while waiting
    // for the lock.
    let row: VideoRow = query_as(
        r#"UPDATE videos
           SET like_count = (SELECT count(*) FROM likes WHERE video_id = $1),
               comment_count = (SELECT count(*) FROM comments WHERE video_id = $1)
           WHERE id = $1
           RETURNING id, author_id, title, play_url, cover_url,
                     like_count, comment_count, publish_at_ms"#,
    )
    .bind(video_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| query_error("Failed to recount video counters", e))?;

    Ok(into_video(row))
}
