//! Cache-aside loading of single entities.
//!
//! A hit decodes the cached field map. A miss reads the durable store and
//! writes back either the full record (base TTL plus random jitter) or the
//! negative-cache sentinel (short TTL). Concurrent misses on the same id are
//! not deduplicated; the overwrite is idempotent.

use std::future::Future;
use std::time::Duration;

use clipstream_storage::{Comment, DynDurableStore, StorageError, User, Video};
use futures_util::future::join_all;
use rand::Rng;

use crate::cache::record::absent_fields;
use crate::cache::{CacheBackend, CacheRecord, Decoded, keys};
use crate::config::CacheConfig;
use crate::error::CoreError;

/// Expiry settings shared by the loader, rebuilds and the counter engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub entity: Duration,
    pub jitter: Duration,
    pub negative: Duration,
    pub set: Duration,
    pub lock: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl TtlPolicy {
    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self {
            entity: cfg.entity_ttl(),
            jitter: cfg.entity_ttl_jitter(),
            negative: cfg.negative_ttl(),
            set: cfg.set_ttl(),
            lock: cfg.lock_ttl(),
        }
    }

    /// Entity TTL with uniform jitter in `[0, jitter]`, so records loaded
    /// together do not expire together.
    pub fn jittered_entity(&self) -> Duration {
        let max = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return self.entity;
        }
        self.entity + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Entity kinds with a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Video,
    Comment,
}

impl EntityKind {
    pub fn key(self, id: i64) -> String {
        match self {
            Self::User => keys::user(id),
            Self::Video => keys::video(id),
            Self::Comment => keys::comment(id),
        }
    }
}

#[derive(Clone)]
pub struct EntityLoader {
    cache: CacheBackend,
    store: DynDurableStore,
    ttl: TtlPolicy,
}

impl EntityLoader {
    pub fn new(cache: CacheBackend, store: DynDurableStore, ttl: TtlPolicy) -> Self {
        Self { cache, store, ttl }
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub async fn get_user(&self, id: i64) -> Result<User, CoreError> {
        let store = self.store.clone();
        self.load(id, move || async move { store.get_user(id).await })
            .await
    }

    pub async fn get_video(&self, id: i64) -> Result<Video, CoreError> {
        let store = self.store.clone();
        self.load(id, move || async move { store.get_video(id).await })
            .await
    }

    pub async fn get_comment(&self, id: i64) -> Result<Comment, CoreError> {
        let store = self.store.clone();
        self.load(id, move || async move { store.get_comment(id).await })
            .await
    }

    /// Resolves videos in order, skipping ids that are missing or fail to load.
    pub async fn get_videos(&self, ids: &[i64]) -> Vec<Video> {
        let results = join_all(ids.iter().map(|id| self.get_video(*id))).await;
        collect_present(ids, results, "video")
    }

    pub async fn get_users(&self, ids: &[i64]) -> Vec<User> {
        let results = join_all(ids.iter().map(|id| self.get_user(*id))).await;
        collect_present(ids, results, "user")
    }

    pub async fn get_comments(&self, ids: &[i64]) -> Vec<Comment> {
        let results = join_all(ids.iter().map(|id| self.get_comment(*id))).await;
        collect_present(ids, results, "comment")
    }

    /// Writes `entity` as a fresh cached record.
    pub async fn warm<T: CacheRecord>(&self, entity: &T) -> Result<(), CoreError> {
        let key = T::key(entity.id());
        self.cache
            .hset_all(&key, &entity.to_fields(), self.ttl.jittered_entity())
            .await?;
        Ok(())
    }

    /// Drops the cached record so the next read reloads it.
    pub async fn invalidate(&self, kind: EntityKind, id: i64) -> Result<bool, CoreError> {
        let key = kind.key(id);
        let removed = self.cache.del(&key).await?;
        tracing::debug!(key = %key, removed, "Cached record invalidated");
        Ok(removed)
    }

    async fn load<T, F, Fut>(&self, id: i64, fetch: F) -> Result<T, CoreError>
    where
        T: CacheRecord,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, StorageError>>,
    {
        let key = T::key(id);
        let fields = self.cache.hgetall(&key).await?;
        match T::decode(&fields) {
            Decoded::Present(entity) => {
                crate::metrics::record_cache_hit(T::KIND);
                return Ok(entity);
            }
            Decoded::Absent => {
                crate::metrics::record_negative_hit(T::KIND);
                return Err(CoreError::not_found(T::KIND, id));
            }
            Decoded::Miss => crate::metrics::record_cache_miss(T::KIND),
        }

        match fetch().await? {
            Some(entity) => {
                let ttl = self.ttl.jittered_entity();
                if let Err(e) = self.cache.hset_all(&key, &entity.to_fields(), ttl).await {
                    tracing::warn!(key = %key, error = %e, "Failed to cache loaded record");
                } else {
                    tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Record cached");
                }
                Ok(entity)
            }
            None => {
                if let Err(e) = self
                    .cache
                    .hset_all(&key, &absent_fields(), self.ttl.negative)
                    .await
                {
                    tracing::warn!(key = %key, error = %e, "Failed to cache negative entry");
                }
                Err(CoreError::not_found(T::KIND, id))
            }
        }
    }
}

fn collect_present<T>(ids: &[i64], results: Vec<Result<T, CoreError>>, kind: &str) -> Vec<T> {
    ids.iter()
        .zip(results)
        .filter_map(|(id, result)| match result {
            Ok(entity) => Some(entity),
            Err(e) => {
                tracing::warn!(kind = %kind, id = %id, error = %e, "Failed to resolve member, skipped");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipstream_db_memory::{InMemoryStore, QueryKind};
    use std::sync::Arc;

    fn video(id: i64) -> Video {
        Video {
            id,
            author_id: 1,
            title: format!("video {id}"),
            play_url: String::new(),
            cover_url: String::new(),
            like_count: 3,
            comment_count: 1,
            publish_at_ms: 1_000,
        }
    }

    async fn setup() -> (EntityLoader, Arc<InMemoryStore>, CacheBackend) {
        let store = Arc::new(InMemoryStore::new());
        store.seed_video(video(42)).await;
        let cache = CacheBackend::new_local();
        let loader = EntityLoader::new(cache.clone(), store.clone(), TtlPolicy::default());
        (loader, store, cache)
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let (loader, store, _) = setup().await;
        assert_eq!(loader.get_video(42).await.unwrap(), video(42));
        assert_eq!(loader.get_video(42).await.unwrap(), video(42));
        assert_eq!(store.stats().count(QueryKind::GetVideo), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let (loader, store, _) = setup().await;
        loader.get_video(42).await.unwrap();
        assert!(loader.invalidate(EntityKind::Video, 42).await.unwrap());
        loader.get_video(42).await.unwrap();
        assert_eq!(store.stats().count(QueryKind::GetVideo), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_entry_expires() {
        let (loader, store, _) = setup().await;
        assert!(loader.get_user(9).await.unwrap_err().is_not_found());
        assert!(loader.get_user(9).await.unwrap_err().is_not_found());
        assert_eq!(store.stats().count(QueryKind::GetUser), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(loader.get_user(9).await.unwrap_err().is_not_found());
        assert_eq!(store.stats().count(QueryKind::GetUser), 2);
    }

    #[tokio::test]
    async fn test_get_videos_skips_missing() {
        let (loader, store, _) = setup().await;
        store.seed_video(video(43)).await;
        let videos = loader.get_videos(&[43, 99, 42]).await;
        let ids: Vec<i64> = videos.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![43, 42]);
    }

    #[test]
    fn test_jitter_bounds() {
        let ttl = TtlPolicy::default();
        for _ in 0..100 {
            let d = ttl.jittered_entity();
            assert!(d >= ttl.entity && d <= ttl.entity + ttl.jitter);
        }
    }
}
