//! Cache key and channel naming.
//!
//! Entity records live under `<kind>:<id>`, per-owner sets under
//! `<kind>_<relation>:<ownerId>`.

/// Member written into every rebuilt set so that "populated but empty" is
/// distinguishable from "never populated". Readers skip it.
pub const PLACEHOLDER: &str = "";

/// Global feed index, scored by publish time in milliseconds.
pub const FEED: &str = "feed:global";

pub fn user(id: i64) -> String {
    format!("user:{id}")
}

pub fn video(id: i64) -> String {
    format!("video:{id}")
}

pub fn comment(id: i64) -> String {
    format!("comment:{id}")
}

/// Videos liked by a user (set).
pub fn user_likes(user_id: i64) -> String {
    format!("user_likes:{user_id}")
}

/// Videos published by a user (sorted set, publish time).
pub fn user_videos(user_id: i64) -> String {
    format!("user_videos:{user_id}")
}

/// Users a user follows (set).
pub fn user_followed(user_id: i64) -> String {
    format!("user_followed:{user_id}")
}

/// Users following a user (set).
pub fn user_followers(user_id: i64) -> String {
    format!("user_followers:{user_id}")
}

/// Comments on a video (sorted set, creation time).
pub fn video_comments(video_id: i64) -> String {
    format!("video_comments:{video_id}")
}

/// Rebuild lock for an owner key.
pub fn lock(owner_key: &str) -> String {
    format!("lock:{owner_key}")
}

/// Parses set members into ids, skipping the placeholder and anything malformed.
pub fn member_ids<I, S>(members: I) -> Vec<i64>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    members
        .into_iter()
        .filter_map(|m| {
            let m = m.as_ref();
            if m == PLACEHOLDER {
                return None;
            }
            match m.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(member = %m, "Skipping non-numeric set member");
                    None
                }
            }
        })
        .collect()
}

/// Write-back channels, one per mutation class.
pub mod channels {
    pub const LIKE: &str = "writeback:like";
    pub const FOLLOW: &str = "writeback:follow";
    pub const COMMENT_DELETE: &str = "writeback:comment_delete";
}
