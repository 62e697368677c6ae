//! Atomic counter and membership engine.
//!
//! Every like, follow and comment mutation is one cache script that checks the
//! owner's membership index, updates it together with the cached counter and
//! enqueues the durable write-back. A script that finds its index cold gets
//! one rebuild and one retry.

use clipstream_storage::{
    Comment, DynDurableStore, DynMediaStore, MediaKind, NewComment, NewVideo, Video, now_millis,
};
use uuid::Uuid;

use crate::cache::{CacheBackend, Script, ScriptOutcome, Toggle, keys};
use crate::error::CoreError;
use crate::feed::FeedIndex;
use crate::loader::{EntityKind, EntityLoader, TtlPolicy};
use crate::rebuild::{OwnerSet, SetRebuilder};

/// Script attempts per mutation: the first run plus one retry after a rebuild.
const MAX_ATTEMPTS: usize = 2;

#[derive(Clone)]
pub struct CounterEngine {
    cache: CacheBackend,
    store: DynDurableStore,
    media: DynMediaStore,
    loader: EntityLoader,
    rebuilder: SetRebuilder,
    feed: FeedIndex,
}

impl CounterEngine {
    pub fn new(
        cache: CacheBackend,
        store: DynDurableStore,
        media: DynMediaStore,
        ttl: TtlPolicy,
    ) -> Self {
        let loader = EntityLoader::new(cache.clone(), store.clone(), ttl);
        Self {
            feed: FeedIndex::new(cache.clone(), store.clone(), loader.clone()),
            rebuilder: SetRebuilder::new(cache.clone(), store.clone(), ttl),
            loader,
            cache,
            store,
            media,
        }
    }

    /// Replaces the feed index publish appends to, so the engine shares the
    /// configured index.
    #[must_use]
    pub fn with_feed(mut self, feed: FeedIndex) -> Self {
        self.feed = feed;
        self
    }

    pub fn feed(&self) -> &FeedIndex {
        &self.feed
    }

    pub fn loader(&self) -> &EntityLoader {
        &self.loader
    }

    pub fn rebuilder(&self) -> &SetRebuilder {
        &self.rebuilder
    }

    /// Runs `script`, rebuilding `set` and retrying once if it is cold.
    async fn run_warmed(&self, script: &Script, set: OwnerSet) -> Result<ScriptOutcome, CoreError> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.cache.run_script(script).await? {
                ScriptOutcome::NotWarmed if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(
                        script = script.name(),
                        key = %set.key(),
                        "Index not warmed, rebuilding"
                    );
                    self.rebuilder.rebuild(set).await?;
                }
                ScriptOutcome::NotWarmed => break,
                outcome => return Ok(outcome),
            }
        }

        tracing::error!(script = script.name(), key = %set.key(), "Index still cold after rebuild");
        Err(CoreError::NotWarmed { key: set.key() })
    }

    pub async fn like(&self, user_id: i64, video_id: i64) -> Result<(), CoreError> {
        self.toggle_like(user_id, video_id, Toggle::On).await
    }

    pub async fn unlike(&self, user_id: i64, video_id: i64) -> Result<(), CoreError> {
        self.toggle_like(user_id, video_id, Toggle::Off).await
    }

    async fn toggle_like(&self, user_id: i64, video_id: i64, toggle: Toggle) -> Result<(), CoreError> {
        // Warm the video record so the script adjusts a cached counter.
        self.loader.get_video(video_id).await?;

        let script = Script::ToggleLike {
            user_id,
            video_id,
            toggle,
        };
        match self.run_warmed(&script, OwnerSet::UserLikes(user_id)).await? {
            ScriptOutcome::NoOp => Err(CoreError::AlreadyApplied {
                action: if toggle.is_on() { "liked" } else { "unliked" },
            }),
            _ => {
                tracing::info!(user_id, video_id, toggle = ?toggle, "Like toggled");
                Ok(())
            }
        }
    }

    pub async fn follow(&self, user_id: i64, target_id: i64) -> Result<(), CoreError> {
        self.toggle_follow(user_id, target_id, Toggle::On).await
    }

    pub async fn unfollow(&self, user_id: i64, target_id: i64) -> Result<(), CoreError> {
        self.toggle_follow(user_id, target_id, Toggle::Off).await
    }

    async fn toggle_follow(
        &self,
        user_id: i64,
        target_id: i64,
        toggle: Toggle,
    ) -> Result<(), CoreError> {
        if user_id == target_id {
            return Err(CoreError::invalid_input("users cannot follow themselves"));
        }
        self.loader.get_user(target_id).await?;

        let script = Script::ToggleFollow {
            user_id,
            target_id,
            toggle,
        };
        match self.run_warmed(&script, OwnerSet::UserFollowed(user_id)).await? {
            ScriptOutcome::NoOp => Err(CoreError::AlreadyApplied {
                action: if toggle.is_on() { "following" } else { "unfollowed" },
            }),
            _ => {
                tracing::info!(user_id, target_id, toggle = ?toggle, "Follow toggled");
                Ok(())
            }
        }
    }

    /// Persists a comment, then indexes it in the cache.
    ///
    /// The durable insert and its counter increment are synchronous because
    /// the id is needed. Indexing is best effort: on failure the cached video
    /// record is dropped so its comment count is reloaded.
    pub async fn add_comment(
        &self,
        user_id: i64,
        video_id: i64,
        content: &str,
    ) -> Result<Comment, CoreError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CoreError::invalid_input("comment content must not be empty"));
        }
        self.loader.get_video(video_id).await?;

        let comment = self
            .store
            .create_comment(NewComment {
                user_id,
                video_id,
                parent_id: 0,
                content: content.to_string(),
                created_at_ms: now_millis(),
            })
            .await?;

        if let Err(e) = self.loader.warm(&comment).await {
            tracing::warn!(comment_id = comment.id, error = %e, "Failed to cache new comment");
        }

        let script = Script::AppendComment {
            video_id,
            comment_id: comment.id,
            created_at_ms: comment.created_at_ms,
        };
        if let Err(e) = self.run_warmed(&script, OwnerSet::VideoComments(video_id)).await {
            tracing::warn!(
                video_id,
                comment_id = comment.id,
                error = %e,
                "Failed to index new comment"
            );
            if let Err(e) = self.loader.invalidate(EntityKind::Video, video_id).await {
                tracing::warn!(video_id, error = %e, "Failed to drop stale video record");
            }
        }

        tracing::info!(user_id, video_id, comment_id = comment.id, "Comment added");
        Ok(comment)
    }

    /// Removes a comment written by `user_id`. The durable delete runs in the
    /// write-back pipeline.
    pub async fn delete_comment(
        &self,
        user_id: i64,
        video_id: i64,
        comment_id: i64,
    ) -> Result<(), CoreError> {
        let comment = self.loader.get_comment(comment_id).await?;
        if comment.video_id != video_id {
            return Err(CoreError::not_found("comment", comment_id));
        }
        if comment.user_id != user_id {
            return Err(CoreError::invalid_input(format!(
                "comment {comment_id} was not written by user {user_id}"
            )));
        }

        let script = Script::RemoveComment {
            video_id,
            comment_id,
        };
        match self.run_warmed(&script, OwnerSet::VideoComments(video_id)).await? {
            ScriptOutcome::NoOp => Err(CoreError::not_found("comment", comment_id)),
            _ => {
                tracing::info!(user_id, video_id, comment_id, "Comment deleted");
                Ok(())
            }
        }
    }

    /// Uploads both blobs, creates the video row and indexes it in the
    /// author's published set and the global feed.
    pub async fn publish_video(
        &self,
        author_id: i64,
        title: &str,
        video_bytes: Vec<u8>,
        cover_bytes: Vec<u8>,
    ) -> Result<Video, CoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(CoreError::invalid_input("video title must not be empty"));
        }
        if video_bytes.is_empty() {
            return Err(CoreError::invalid_input("video data must not be empty"));
        }
        self.loader.get_user(author_id).await?;

        let name = Uuid::new_v4().simple().to_string();
        let video_key = MediaKind::Video.object_key(&name);
        let cover_key = MediaKind::Cover.object_key(&name);
        self.media.put(&video_key, video_bytes).await?;
        self.media.put(&cover_key, cover_bytes).await?;

        let video = self
            .store
            .create_video(NewVideo {
                author_id,
                title: title.to_string(),
                play_url: self.media.url_for(&video_key),
                cover_url: self.media.url_for(&cover_key),
                publish_at_ms: now_millis(),
            })
            .await?;

        let script = Script::AppendVideo {
            video: video.clone(),
            record_ttl: self.loader.ttl().jittered_entity(),
        };
        if let Err(e) = self.run_warmed(&script, OwnerSet::UserVideos(author_id)).await {
            tracing::warn!(video_id = video.id, error = %e, "Failed to index published video");
            if let Err(e) = self.feed.append(&video).await {
                tracing::warn!(video_id = video.id, error = %e, "Failed to append video to feed");
            }
        }

        tracing::info!(author_id, video_id = video.id, "Video published");
        Ok(video)
    }

    pub async fn has_liked(&self, user_id: i64, video_id: i64) -> Result<bool, CoreError> {
        self.is_member(OwnerSet::UserLikes(user_id), video_id).await
    }

    pub async fn is_following(&self, user_id: i64, target_id: i64) -> Result<bool, CoreError> {
        if user_id == target_id {
            return Ok(false);
        }
        self.is_member(OwnerSet::UserFollowed(user_id), target_id)
            .await
    }

    pub async fn follower_count(&self, user_id: i64) -> Result<usize, CoreError> {
        self.member_count(OwnerSet::UserFollowers(user_id)).await
    }

    pub async fn followed_count(&self, user_id: i64) -> Result<usize, CoreError> {
        self.member_count(OwnerSet::UserFollowed(user_id)).await
    }

    pub async fn like_count(&self, video_id: i64) -> Result<i64, CoreError> {
        Ok(self.loader.get_video(video_id).await?.like_count)
    }

    /// Member ids of `set`, newest first for sorted sets.
    ///
    /// A warm set always holds the placeholder, so an empty read means the
    /// set expired between the warm check and the read.
    pub async fn members(&self, set: OwnerSet) -> Result<Vec<i64>, CoreError> {
        let key = set.key();
        for _ in 0..MAX_ATTEMPTS {
            self.rebuilder.ensure_or_wait(set).await?;
            let raw = if set.is_sorted() {
                self.cache.zrevrange_all(&key).await?
            } else {
                self.cache.smembers(&key).await?
            };
            if !raw.is_empty() {
                return Ok(keys::member_ids(raw));
            }
        }
        Err(CoreError::NotWarmed { key })
    }

    async fn is_member(&self, set: OwnerSet, id: i64) -> Result<bool, CoreError> {
        self.rebuilder.ensure_or_wait(set).await?;
        Ok(self.cache.sismember(&set.key(), &id.to_string()).await?)
    }

    async fn member_count(&self, set: OwnerSet) -> Result<usize, CoreError> {
        let key = set.key();
        for _ in 0..MAX_ATTEMPTS {
            self.rebuilder.ensure_or_wait(set).await?;
            let size = if set.is_sorted() {
                self.cache.zcard(&key).await?
            } else {
                self.cache.scard(&key).await?
            };
            // Placeholder excluded.
            if size > 0 {
                return Ok(size - 1);
            }
        }
        Err(CoreError::NotWarmed { key })
    }
}
