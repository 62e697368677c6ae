//! Rebuilding of per-owner membership sets from the durable store.

use std::time::Duration;

use clipstream_storage::DynDurableStore;

use crate::cache::{CacheBackend, keys};
use crate::error::CoreError;
use crate::loader::TtlPolicy;
use crate::lock::RebuildLock;

/// A per-owner membership or ordering set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerSet {
    /// Videos liked by a user.
    UserLikes(i64),
    /// Videos published by a user, scored by publish time.
    UserVideos(i64),
    /// Users a user follows.
    UserFollowed(i64),
    /// Users following a user.
    UserFollowers(i64),
    /// Comments on a video, scored by creation time.
    VideoComments(i64),
}

impl OwnerSet {
    pub fn key(self) -> String {
        match self {
            Self::UserLikes(id) => keys::user_likes(id),
            Self::UserVideos(id) => keys::user_videos(id),
            Self::UserFollowed(id) => keys::user_followed(id),
            Self::UserFollowers(id) => keys::user_followers(id),
            Self::VideoComments(id) => keys::video_comments(id),
        }
    }

    pub fn relation(self) -> &'static str {
        match self {
            Self::UserLikes(_) => "user_likes",
            Self::UserVideos(_) => "user_videos",
            Self::UserFollowed(_) => "user_followed",
            Self::UserFollowers(_) => "user_followers",
            Self::VideoComments(_) => "video_comments",
        }
    }

    /// Sorted sets are read newest first.
    pub fn is_sorted(self) -> bool {
        matches!(self, Self::UserVideos(_) | Self::VideoComments(_))
    }
}

/// Polls of a set whose rebuild is held by another caller.
const LOCK_WAIT_ATTEMPTS: usize = 8;
const LOCK_WAIT_START: Duration = Duration::from_millis(25);
const LOCK_WAIT_MAX: Duration = Duration::from_millis(400);

#[derive(Clone)]
pub struct SetRebuilder {
    cache: CacheBackend,
    store: DynDurableStore,
    lock: RebuildLock,
    ttl: TtlPolicy,
}

impl SetRebuilder {
    pub fn new(cache: CacheBackend, store: DynDurableStore, ttl: TtlPolicy) -> Self {
        Self {
            lock: RebuildLock::new(cache.clone()),
            cache,
            store,
            ttl,
        }
    }

    /// Rebuilds the set unless it is already warm.
    pub async fn ensure(&self, set: OwnerSet) -> Result<(), CoreError> {
        if self.cache.exists(&set.key()).await? {
            return Ok(());
        }
        self.rebuild(set).await
    }

    /// Like [`ensure`](Self::ensure), but waits out a rebuild held by another
    /// caller instead of failing with [`CoreError::LockBusy`].
    pub async fn ensure_or_wait(&self, set: OwnerSet) -> Result<(), CoreError> {
        let mut delay = LOCK_WAIT_START;
        for _ in 0..LOCK_WAIT_ATTEMPTS {
            match self.ensure(set).await {
                Err(CoreError::LockBusy { .. }) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(LOCK_WAIT_MAX);
                }
                other => return other,
            }
        }
        self.ensure(set).await
    }

    /// Rebuilds `set` under its rebuild lock.
    ///
    /// The set is re-checked after the lock is taken, so a caller that lost
    /// the race to a finished rebuild does not query the store again.
    pub async fn rebuild(&self, set: OwnerSet) -> Result<(), CoreError> {
        let key = set.key();
        self.lock
            .with_rebuild_lock(&key, self.ttl.lock, async {
                if self.cache.exists(&key).await? {
                    tracing::debug!(key = %key, "Set warmed by another caller");
                    return Ok(());
                }
                let size = self.populate(set, &key).await?;
                crate::metrics::record_set_rebuild(set.relation());
                tracing::debug!(key = %key, members = size, "Set rebuilt from durable store");
                Ok::<_, CoreError>(())
            })
            .await
    }

    async fn populate(&self, set: OwnerSet, key: &str) -> Result<usize, CoreError> {
        let placeholder = keys::PLACEHOLDER.to_string();
        let ttl = self.ttl.set;

        if set.is_sorted() {
            let mut items: Vec<(f64, String)> = match set {
                OwnerSet::UserVideos(owner) => self
                    .store
                    .videos_by_author(owner)
                    .await?
                    .into_iter()
                    .map(|v| (v.publish_at_ms as f64, v.id.to_string()))
                    .collect(),
                OwnerSet::VideoComments(video) => self
                    .store
                    .comments_on_video(video)
                    .await?
                    .into_iter()
                    .map(|c| (c.created_at_ms as f64, c.id.to_string()))
                    .collect(),
                _ => Vec::new(),
            };
            let size = items.len();
            items.push((0.0, placeholder));
            self.cache.rebuild_zset(key, &items, ttl).await?;
            return Ok(size);
        }

        let ids = match set {
            OwnerSet::UserLikes(owner) => self.store.liked_video_ids(owner).await?,
            OwnerSet::UserFollowed(owner) => self.store.followed_ids(owner).await?,
            OwnerSet::UserFollowers(owner) => self.store.follower_ids(owner).await?,
            _ => Vec::new(),
        };
        let size = ids.len();
        let mut members: Vec<String> = ids.iter().map(i64::to_string).collect();
        members.push(placeholder);
        self.cache.rebuild_set(key, &members, ttl).await?;
        Ok(size)
    }
}
