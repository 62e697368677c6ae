//! Row types owned by the durable store.
//!
//! Ids are database-generated `BIGINT`s. Timestamps are stored as plain integers:
//! videos carry their publish time in Unix milliseconds (it doubles as the feed
//! score), comments carry their creation time in Unix seconds.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Table names used in errors, logs and SQL.
pub mod tables {
    pub const USERS: &str = "users";
    pub const VIDEOS: &str = "videos";
    pub const COMMENTS: &str = "comments";
    pub const LIKES: &str = "likes";
    pub const FOLLOWS: &str = "follows";
}

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub nickname: String,
    pub avatar_url: String,
    pub background_img_url: String,
}

/// Payload for creating a user row.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub nickname: String,
    pub avatar_url: String,
    pub background_img_url: String,
}

/// A published video with its aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: i64,
    pub author_id: i64,
    pub title: String,
    pub play_url: String,
    pub cover_url: String,
    pub like_count: i64,
    pub comment_count: i64,
    /// Publish time in Unix milliseconds.
    pub publish_at_ms: i64,
}

impl Video {
    /// Returns the value of the given counter column.
    pub fn counter(&self, column: CounterColumn) -> i64 {
        match column {
            CounterColumn::LikeCount => self.like_count,
            CounterColumn::CommentCount => self.comment_count,
        }
    }
}

/// Payload for creating a video row. Counters always start at zero.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub author_id: i64,
    pub title: String,
    pub play_url: String,
    pub cover_url: String,
    pub publish_at_ms: i64,
}

/// A comment on a video. `parent_id` is 0 for top-level comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub user_id: i64,
    pub video_id: i64,
    pub parent_id: i64,
    pub content: String,
    /// Creation time in Unix milliseconds.
    pub created_at_ms: i64,
}

/// Payload for creating a comment row.
#[derive(Debug, Clone)]
pub struct NewComment {
    pub user_id: i64,
    pub video_id: i64,
    pub parent_id: i64,
    pub content: String,
    pub created_at_ms: i64,
}

/// Aggregate counter columns on the `videos` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterColumn {
    LikeCount,
    CommentCount,
}

impl CounterColumn {
    /// Column name, shared by SQL and the cached field map.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LikeCount => "like_count",
            Self::CommentCount => "comment_count",
        }
    }
}

impl std::fmt::Display for CounterColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
