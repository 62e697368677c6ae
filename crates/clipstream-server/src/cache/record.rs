//! Schema-driven field-map codec for cached entity records.
//!
//! A cached record is a flat hash of named string fields. Decoding never fails
//! on missing fields: numbers default to 0 and strings to empty. A record
//! containing [`ABSENT_FIELD`] is a negative-cache entry.

use std::collections::HashMap;

use clipstream_storage::{Comment, User, Video};

use super::keys;

/// Reserved field marking "entity confirmed absent".
pub const ABSENT_FIELD: &str = "__absent";

/// Field list stored for a negative-cache entry.
pub fn absent_fields() -> Vec<(String, String)> {
    vec![(ABSENT_FIELD.to_string(), "1".to_string())]
}

/// Result of decoding a cached field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// The key does not exist.
    Miss,
    /// Negative-cache entry.
    Absent,
    Present(T),
}

/// An entity that can be stored as a cache field map.
pub trait CacheRecord: Sized + Send {
    /// Entity kind used in keys, logs and errors.
    const KIND: &'static str;

    /// Cache key of the record with this id.
    fn key(id: i64) -> String;

    fn id(&self) -> i64;

    fn to_fields(&self) -> Vec<(String, String)>;

    fn from_fields(fields: &HashMap<String, String>) -> Self;

    /// Decodes a raw `HGETALL` reply.
    fn decode(fields: &HashMap<String, String>) -> Decoded<Self> {
        if fields.is_empty() {
            Decoded::Miss
        } else if fields.contains_key(ABSENT_FIELD) {
            Decoded::Absent
        } else {
            Decoded::Present(Self::from_fields(fields))
        }
    }
}

fn int_field(fields: &HashMap<String, String>, name: &str) -> i64 {
    match fields.get(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(field = %name, value = %raw, "Non-numeric cached field, using 0");
            0
        }),
        None => 0,
    }
}

fn str_field(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

impl CacheRecord for User {
    const KIND: &'static str = "user";

    fn key(id: i64) -> String {
        keys::user(id)
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("id", self.id),
            field("username", &self.username),
            field("nickname", &self.nickname),
            field("avatar_url", &self.avatar_url),
            field("background_img_url", &self.background_img_url),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            id: int_field(fields, "id"),
            username: str_field(fields, "username"),
            nickname: str_field(fields, "nickname"),
            avatar_url: str_field(fields, "avatar_url"),
            background_img_url: str_field(fields, "background_img_url"),
        }
    }
}

impl CacheRecord for Video {
    const KIND: &'static str = "video";

    fn key(id: i64) -> String {
        keys::video(id)
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("id", self.id),
            field("author_id", self.author_id),
            field("title", &self.title),
            field("play_url", &self.play_url),
            field("cover_url", &self.cover_url),
            field("like_count", self.like_count),
            field("comment_count", self.comment_count),
            field("publish_at_ms", self.publish_at_ms),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            id: int_field(fields, "id"),
            author_id: int_field(fields, "author_id"),
            title: str_field(fields, "title"),
            play_url: str_field(fields, "play_url"),
            cover_url: str_field(fields, "cover_url"),
            like_count: int_field(fields, "like_count"),
            comment_count: int_field(fields, "comment_count"),
            publish_at_ms: int_field(fields, "publish_at_ms"),
        }
    }
}

impl CacheRecord for Comment {
    const KIND: &'static str = "comment";

    fn key(id: i64) -> String {
        keys::comment(id)
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("id", self.id),
            field("user_id", self.user_id),
            field("video_id", self.video_id),
            field("parent_id", self.parent_id),
            field("content", &self.content),
            field("created_at_ms", self.created_at_ms),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            id: int_field(fields, "id"),
            user_id: int_field(fields, "user_id"),
            video_id: int_field(fields, "video_id"),
            parent_id: int_field(fields, "parent_id"),
            content: str_field(fields, "content"),
            created_at_ms: int_field(fields, "created_at_ms"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_video_fields_round_trip() {
        let video = Video {
            id: 42,
            author_id: 7,
            title: "sunset".into(),
            play_url: "http://m/video/a.mp4".into(),
            cover_url: "http://m/cover/a.jpg".into(),
            like_count: 5,
            comment_count: 2,
            publish_at_ms: 1_700_000_000_000,
        };
        let fields: HashMap<_, _> = video.to_fields().into_iter().collect();
        assert_eq!(Video::decode(&fields), Decoded::Present(video));
    }

    #[test]
    fn test_missing_fields_default() {
        let video = Video::from_fields(&map(&[("id", "3"), ("title", "t")]));
        assert_eq!(video.id, 3);
        assert_eq!(video.like_count, 0);
        assert_eq!(video.play_url, "");

        let user = User::from_fields(&map(&[("id", "x")]));
        assert_eq!(user.id, 0);
    }

    #[test]
    fn test_sentinel_and_miss() {
        assert_eq!(Comment::decode(&HashMap::new()), Decoded::Miss);
        let absent: HashMap<_, _> = absent_fields().into_iter().collect();
        assert_eq!(User::decode(&absent), Decoded::Absent);
    }
}
