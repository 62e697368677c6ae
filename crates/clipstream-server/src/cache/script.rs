//! Atomic multi-step cache scripts.
//!
//! Each script checks that its membership index is warm, tests current state,
//! mutates the index and the cached counter together and, where the mutation
//! must reach the durable store, publishes the write-back message. Redis runs
//! the Lua source; the local backend runs [`Script::run_local`] under its
//! state lock.
//!
//! Status contract: `0` applied, `1` index not warmed, `2` no-op.

use std::time::Duration;

use clipstream_storage::Video;

use super::error::CacheError;
use super::keys::{self, channels};
use super::local::LocalState;
use super::record::{ABSENT_FIELD, CacheRecord};
use crate::writeback::WriteBackMessage;

const APPLIED: i64 = 0;
const NOT_WARMED: i64 = 1;
const NO_OP: i64 = 2;

/// Desired membership state for like/follow toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }

    /// Counter adjustment that accompanies this toggle.
    pub fn delta(self) -> i64 {
        match self {
            Self::On => 1,
            Self::Off => -1,
        }
    }

    fn flag(self) -> &'static str {
        if self.is_on() { "1" } else { "0" }
    }
}

/// Outcome of a script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Applied,
    /// The membership index was never populated; rebuild and retry.
    NotWarmed,
    /// The requested state already holds.
    NoOp,
}

impl ScriptOutcome {
    pub(crate) fn from_status(script: &'static str, status: i64) -> Result<Self, CacheError> {
        match status {
            APPLIED => Ok(Self::Applied),
            NOT_WARMED => Ok(Self::NotWarmed),
            NO_OP => Ok(Self::NoOp),
            status => Err(CacheError::UnexpectedStatus { script, status }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::NotWarmed => "not_warmed",
            Self::NoOp => "no_op",
        }
    }
}

/// The closed set of atomic cache scripts.
#[derive(Debug, Clone)]
pub enum Script {
    /// Add or remove `video_id` in `user_likes:<user_id>`, adjust the cached
    /// like count and publish to the like channel.
    ToggleLike {
        user_id: i64,
        video_id: i64,
        toggle: Toggle,
    },
    /// Add or remove `target_id` in `user_followed:<user_id>`, mirror into
    /// `user_followers:<target_id>` when that set is warm and publish.
    ToggleFollow {
        user_id: i64,
        target_id: i64,
        toggle: Toggle,
    },
    /// Insert an already-persisted comment into `video_comments:<video_id>`.
    AppendComment {
        video_id: i64,
        comment_id: i64,
        created_at_ms: i64,
    },
    /// Remove a comment from its video's index, drop its record and publish
    /// the durable delete.
    RemoveComment { video_id: i64, comment_id: i64 },
    /// Write a freshly created video record and append it to its author's
    /// published set and the global feed.
    AppendVideo { video: Video, record_ttl: Duration },
}

pub(crate) const TOGGLE_LIKE_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 1 end
local want = ARGV[2] == '1'
local present = redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1
if present == want then return 2 end
if want then
  redis.call('SADD', KEYS[1], ARGV[1])
else
  redis.call('SREM', KEYS[1], ARGV[1])
end
if redis.call('EXISTS', KEYS[2]) == 1 and redis.call('HEXISTS', KEYS[2], '__absent') == 0 then
  redis.call('HINCRBY', KEYS[2], 'like_count', tonumber(ARGV[3]))
end
redis.call('PUBLISH', ARGV[4], ARGV[5])
return 0
";

pub(crate) const TOGGLE_FOLLOW_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 1 end
local want = ARGV[2] == '1'
local present = redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1
if present == want then return 2 end
local mirror = redis.call('EXISTS', KEYS[2]) == 1
if want then
  redis.call('SADD', KEYS[1], ARGV[1])
  if mirror then redis.call('SADD', KEYS[2], ARGV[3]) end
else
  redis.call('SREM', KEYS[1], ARGV[1])
  if mirror then redis.call('SREM', KEYS[2], ARGV[3]) end
end
redis.call('PUBLISH', ARGV[4], ARGV[5])
return 0
";

pub(crate) const APPEND_COMMENT_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 1 end
local added = redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
if redis.call('EXISTS', KEYS[2]) == 1 and redis.call('HEXISTS', KEYS[2], '__absent') == 0 then
  if added == 1 then
    redis.call('HINCRBY', KEYS[2], 'comment_count', 1)
  else
    redis.call('DEL', KEYS[2])
  end
end
if added == 1 then return 0 end
return 2
";

pub(crate) const REMOVE_COMMENT_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 1 end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 2 end
redis.call('DEL', KEYS[2])
if redis.call('EXISTS', KEYS[3]) == 1 and redis.call('HEXISTS', KEYS[3], '__absent') == 0 then
  redis.call('HINCRBY', KEYS[3], 'comment_count', -1)
end
redis.call('PUBLISH', ARGV[2], ARGV[3])
return 0
";

pub(crate) const APPEND_VIDEO_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 1 end
redis.call('DEL', KEYS[2])
for i = 4, #ARGV, 2 do
  redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
end
redis.call('PEXPIRE', KEYS[2], tonumber(ARGV[3]))
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
return 0
";

/// True if `key` holds a real (non-sentinel) record.
fn is_real_record(state: &mut LocalState, key: &str) -> Result<bool, CacheError> {
    Ok(state.exists(key) && !state.hexists(key, ABSENT_FIELD)?)
}

impl Script {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToggleLike { .. } => "toggle_like",
            Self::ToggleFollow { .. } => "toggle_follow",
            Self::AppendComment { .. } => "append_comment",
            Self::RemoveComment { .. } => "remove_comment",
            Self::AppendVideo { .. } => "append_video",
        }
    }

    /// The membership index whose absence yields [`ScriptOutcome::NotWarmed`].
    pub fn index_key(&self) -> String {
        match self {
            Self::ToggleLike { user_id, .. } => keys::user_likes(*user_id),
            Self::ToggleFollow { user_id, .. } => keys::user_followed(*user_id),
            Self::AppendComment { video_id, .. } | Self::RemoveComment { video_id, .. } => {
                keys::video_comments(*video_id)
            }
            Self::AppendVideo { video, .. } => keys::user_videos(video.author_id),
        }
    }

    /// Write-back message published when the script applies, if any.
    pub fn message(&self) -> Option<WriteBackMessage> {
        match *self {
            Self::ToggleLike {
                user_id,
                video_id,
                toggle,
            } => Some(WriteBackMessage::Like {
                user_id,
                video_id,
                toggle,
            }),
            Self::ToggleFollow {
                user_id,
                target_id,
                toggle,
            } => Some(WriteBackMessage::Follow {
                user_id,
                target_id,
                toggle,
            }),
            Self::RemoveComment {
                video_id,
                comment_id,
            } => Some(WriteBackMessage::CommentDeleted {
                video_id,
                comment_id,
            }),
            Self::AppendComment { .. } | Self::AppendVideo { .. } => None,
        }
    }

    fn channel_and_payload(&self) -> (String, String) {
        self.message()
            .map(|m| (m.channel().to_string(), m.encode()))
            .unwrap_or_default()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        match self {
            Self::ToggleLike {
                user_id, video_id, ..
            } => vec![keys::user_likes(*user_id), keys::video(*video_id)],
            Self::ToggleFollow {
                user_id, target_id, ..
            } => vec![keys::user_followed(*user_id), keys::user_followers(*target_id)],
            Self::AppendComment { video_id, .. } => {
                vec![keys::video_comments(*video_id), keys::video(*video_id)]
            }
            Self::RemoveComment {
                video_id,
                comment_id,
            } => vec![
                keys::video_comments(*video_id),
                keys::comment(*comment_id),
                keys::video(*video_id),
            ],
            Self::AppendVideo { video, .. } => vec![
                keys::user_videos(video.author_id),
                keys::video(video.id),
                keys::FEED.to_string(),
            ],
        }
    }

    pub(crate) fn args(&self) -> Vec<String> {
        let (channel, payload) = self.channel_and_payload();
        match self {
            Self::ToggleLike {
                video_id, toggle, ..
            } => vec![
                video_id.to_string(),
                toggle.flag().to_string(),
                toggle.delta().to_string(),
                channel,
                payload,
            ],
            Self::ToggleFollow {
                user_id,
                target_id,
                toggle,
            } => vec![
                target_id.to_string(),
                toggle.flag().to_string(),
                user_id.to_string(),
                channel,
                payload,
            ],
            Self::AppendComment {
                comment_id,
                created_at_ms,
                ..
            } => vec![comment_id.to_string(), created_at_ms.to_string()],
            Self::RemoveComment { comment_id, .. } => {
                vec![comment_id.to_string(), channel, payload]
            }
            Self::AppendVideo { video, record_ttl } => {
                let mut args = vec![
                    video.id.to_string(),
                    video.publish_at_ms.to_string(),
                    record_ttl.as_millis().to_string(),
                ];
                for (field, value) in video.to_fields() {
                    args.push(field);
                    args.push(value);
                }
                args
            }
        }
    }

    /// Runs the script against the local keyspace. Returns the status code and
    /// the `(channel, payload)` to publish, if the script publishes.
    pub(crate) fn run_local(
        &self,
        st: &mut LocalState,
    ) -> Result<(i64, Option<(&'static str, String)>), CacheError> {
        let index = self.index_key();
        if !st.exists(&index) {
            return Ok((NOT_WARMED, None));
        }

        match self {
            Self::ToggleLike {
                video_id, toggle, ..
            } => {
                let member = video_id.to_string();
                if st.sismember(&index, &member)? == toggle.is_on() {
                    return Ok((NO_OP, None));
                }
                if toggle.is_on() {
                    st.sadd(&index, &[member])?;
                } else {
                    st.srem(&index, &member)?;
                }
                let record = keys::video(*video_id);
                if is_real_record(st, &record)? {
                    st.hincrby(&record, "like_count", toggle.delta())?;
                }
                Ok((APPLIED, self.publication(channels::LIKE)))
            }
            Self::ToggleFollow {
                user_id,
                target_id,
                toggle,
            } => {
                let member = target_id.to_string();
                if st.sismember(&index, &member)? == toggle.is_on() {
                    return Ok((NO_OP, None));
                }
                let mirror = keys::user_followers(*target_id);
                let mirror_warm = st.exists(&mirror);
                let actor = user_id.to_string();
                if toggle.is_on() {
                    st.sadd(&index, &[member])?;
                    if mirror_warm {
                        st.sadd(&mirror, &[actor])?;
                    }
                } else {
                    st.srem(&index, &member)?;
                    if mirror_warm {
                        st.srem(&mirror, &actor)?;
                    }
                }
                Ok((APPLIED, self.publication(channels::FOLLOW)))
            }
            Self::AppendComment {
                video_id,
                comment_id,
                created_at_ms,
            } => {
                let member = (*created_at_ms as f64, comment_id.to_string());
                let added = st.zadd(&index, &[member])? == 1;
                let record = keys::video(*video_id);
                if is_real_record(st, &record)? {
                    if added {
                        st.hincrby(&record, "comment_count", 1)?;
                    } else {
                        st.del(&record);
                    }
                }
                Ok((if added { APPLIED } else { NO_OP }, None))
            }
            Self::RemoveComment {
                video_id,
                comment_id,
            } => {
                if !st.zrem(&index, &comment_id.to_string())? {
                    return Ok((NO_OP, None));
                }
                st.del(&keys::comment(*comment_id));
                let record = keys::video(*video_id);
                if is_real_record(st, &record)? {
                    st.hincrby(&record, "comment_count", -1)?;
                }
                Ok((APPLIED, self.publication(channels::COMMENT_DELETE)))
            }
            Self::AppendVideo { video, record_ttl } => {
                let record = keys::video(video.id);
                st.del(&record);
                st.hset(&record, &video.to_fields())?;
                st.expire(&record, *record_ttl);
                let entry = [(video.publish_at_ms as f64, video.id.to_string())];
                st.zadd(&index, &entry)?;
                st.zadd(keys::FEED, &entry)?;
                Ok((APPLIED, None))
            }
        }
    }

    fn publication(&self, channel: &'static str) -> Option<(&'static str, String)> {
        self.message().map(|m| (channel, m.encode()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::local::LocalCache;

    fn warm_set(cache: &LocalCache, key: &str, members: &[&str]) {
        let mut all = vec![keys::PLACEHOLDER.to_string()];
        all.extend(members.iter().map(|m| m.to_string()));
        cache.with_state(|st| st.sadd(key, &all)).unwrap();
    }

    fn cached_video(cache: &LocalCache, id: i64, like_count: i64) {
        let video = Video {
            id,
            author_id: 9,
            title: "t".into(),
            play_url: String::new(),
            cover_url: String::new(),
            like_count,
            comment_count: 0,
            publish_at_ms: 100,
        };
        cache
            .with_state(|st| st.hset(&keys::video(id), &video.to_fields()))
            .unwrap();
    }

    fn like(toggle: Toggle) -> Script {
        Script::ToggleLike {
            user_id: 1,
            video_id: 42,
            toggle,
        }
    }

    fn run(cache: &LocalCache, script: &Script) -> (i64, Option<(&'static str, String)>) {
        cache.with_state(|st| script.run_local(st)).unwrap()
    }

    #[test]
    fn test_like_state_machine() {
        let cache = LocalCache::default();
        assert_eq!(run(&cache, &like(Toggle::On)).0, NOT_WARMED);

        warm_set(&cache, &keys::user_likes(1), &[]);
        cached_video(&cache, 42, 5);

        let (status, publish) = run(&cache, &like(Toggle::On));
        assert_eq!(status, APPLIED);
        assert_eq!(publish, Some((channels::LIKE, "1:42:like".to_string())));
        assert_eq!(run(&cache, &like(Toggle::On)).0, NO_OP);

        let fields = cache.with_state(|st| st.hgetall(&keys::video(42))).unwrap();
        assert_eq!(fields["like_count"], "6");

        assert_eq!(run(&cache, &like(Toggle::Off)).0, APPLIED);
        assert_eq!(run(&cache, &like(Toggle::Off)).0, NO_OP);
        let fields = cache.with_state(|st| st.hgetall(&keys::video(42))).unwrap();
        assert_eq!(fields["like_count"], "5");
    }

    #[test]
    fn test_like_does_not_touch_negative_entry() {
        let cache = LocalCache::default();
        warm_set(&cache, &keys::user_likes(1), &[]);
        cache
            .with_state(|st| st.hset(&keys::video(42), &crate::cache::record::absent_fields()))
            .unwrap();

        assert_eq!(run(&cache, &like(Toggle::On)).0, APPLIED);
        let fields = cache.with_state(|st| st.hgetall(&keys::video(42))).unwrap();
        assert!(!fields.contains_key("like_count"));
    }

    #[test]
    fn test_follow_mirrors_warm_follower_set() {
        let cache = LocalCache::default();
        warm_set(&cache, &keys::user_followed(1), &[]);
        warm_set(&cache, &keys::user_followers(2), &["5"]);

        let follow = Script::ToggleFollow {
            user_id: 1,
            target_id: 2,
            toggle: Toggle::On,
        };
        let (status, publish) = run(&cache, &follow);
        assert_eq!(status, APPLIED);
        assert_eq!(publish, Some((channels::FOLLOW, "1:2:follow".to_string())));
        let followers = cache
            .with_state(|st| st.smembers(&keys::user_followers(2)))
            .unwrap();
        assert_eq!(keys::member_ids(followers).len(), 2);
    }

    #[test]
    fn test_append_comment_duplicate_drops_record() {
        let cache = LocalCache::default();
        cache
            .with_state(|st| st.zadd(&keys::video_comments(42), &[(0.0, String::new())]))
            .unwrap();
        cached_video(&cache, 42, 0);

        let append = Script::AppendComment {
            video_id: 42,
            comment_id: 7,
            created_at_ms: 1_000,
        };
        assert_eq!(run(&cache, &append).0, APPLIED);
        let fields = cache.with_state(|st| st.hgetall(&keys::video(42))).unwrap();
        assert_eq!(fields["comment_count"], "1");

        assert_eq!(run(&cache, &append).0, NO_OP);
        assert!(!cache.with_state(|st| st.exists(&keys::video(42))));
    }

    #[test]
    fn test_remove_comment() {
        let cache = LocalCache::default();
        cache
            .with_state(|st| {
                st.zadd(
                    &keys::video_comments(42),
                    &[(0.0, String::new()), (1_000.0, "7".to_string())],
                )
            })
            .unwrap();
        let remove = Script::RemoveComment {
            video_id: 42,
            comment_id: 7,
        };
        let (status, publish) = run(&cache, &remove);
        assert_eq!(status, APPLIED);
        assert_eq!(
            publish,
            Some((channels::COMMENT_DELETE, "42:7".to_string()))
        );
        assert_eq!(run(&cache, &remove).0, NO_OP);
    }

    #[test]
    fn test_lua_sentinel_matches_codec() {
        assert!(TOGGLE_LIKE_LUA.contains(ABSENT_FIELD));
        assert!(APPEND_COMMENT_LUA.contains(ABSENT_FIELD));
        assert!(REMOVE_COMMENT_LUA.contains(ABSENT_FIELD));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ScriptOutcome::from_status("x", 2).unwrap(),
            ScriptOutcome::NoOp
        );
        assert!(ScriptOutcome::from_status("x", 9).is_err());
    }
}
