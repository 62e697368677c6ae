//! Global feed index.
//!
//! A single sorted set scored by publish time in milliseconds. It is
//! bootstrapped from the durable store at startup, appended on publish and
//! paged newest first with an exclusive timestamp cursor.

use clipstream_storage::{DynDurableStore, Video};

use crate::cache::{CacheBackend, keys};
use crate::config::FeedConfig;
use crate::error::CoreError;
use crate::loader::EntityLoader;

#[derive(Clone)]
pub struct FeedIndex {
    cache: CacheBackend,
    store: DynDurableStore,
    loader: EntityLoader,
    default_page_size: usize,
    max_page_size: usize,
}

impl FeedIndex {
    pub fn new(cache: CacheBackend, store: DynDurableStore, loader: EntityLoader) -> Self {
        let defaults = FeedConfig::default();
        Self {
            cache,
            store,
            loader,
            default_page_size: defaults.default_page_size,
            max_page_size: defaults.max_page_size,
        }
    }

    #[must_use]
    pub fn with_config(mut self, cfg: &FeedConfig) -> Self {
        self.default_page_size = cfg.default_page_size;
        self.max_page_size = cfg.max_page_size;
        self
    }

    /// Requested page size, defaulted and capped.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(0) | None => self.default_page_size,
            Some(n) => n.min(self.max_page_size),
        }
    }

    /// Scans every video into the index and warms its record.
    pub async fn bootstrap(&self) -> Result<usize, CoreError> {
        let videos = self.store.list_videos().await?;
        if videos.is_empty() {
            tracing::info!("Feed bootstrap found no videos");
            return Ok(0);
        }

        for video in &videos {
            if let Err(e) = self.loader.warm(video).await {
                tracing::warn!(video_id = video.id, error = %e, "Failed to warm video record");
            }
        }
        let items: Vec<(f64, String)> = videos
            .iter()
            .map(|v| (v.publish_at_ms as f64, v.id.to_string()))
            .collect();
        self.cache.zadd(keys::FEED, &items).await?;

        tracing::info!(videos = videos.len(), "Feed index bootstrapped");
        Ok(videos.len())
    }

    pub async fn append(&self, video: &Video) -> Result<(), CoreError> {
        self.cache
            .zadd(
                keys::FEED,
                &[(video.publish_at_ms as f64, video.id.to_string())],
            )
            .await?;
        Ok(())
    }

    /// Ids published strictly after `cursor_ms`, newest first, at most `size`.
    pub async fn page(&self, cursor_ms: i64, size: usize) -> Result<Vec<i64>, CoreError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .cache
            .zrevrange_by_score(keys::FEED, cursor_ms as f64, Some(size))
            .await?;
        Ok(keys::member_ids(raw))
    }

    pub async fn len(&self) -> Result<usize, CoreError> {
        Ok(self.cache.zcard(keys::FEED).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::TtlPolicy;
    use clipstream_db_memory::{InMemoryStore, QueryKind};
    use std::sync::Arc;

    fn video(id: i64, publish_at_ms: i64) -> Video {
        Video {
            id,
            author_id: 1,
            title: format!("video {id}"),
            play_url: String::new(),
            cover_url: String::new(),
            like_count: 0,
            comment_count: 0,
            publish_at_ms,
        }
    }

    async fn setup() -> (FeedIndex, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.seed_video(video(1, 100)).await;
        store.seed_video(video(2, 200)).await;
        store.seed_video(video(3, 300)).await;
        let cache = CacheBackend::new_local();
        let loader = EntityLoader::new(cache.clone(), store.clone(), TtlPolicy::default());
        (FeedIndex::new(cache, store.clone(), loader), store)
    }

    #[tokio::test]
    async fn test_page_after_cursor() {
        let (feed, _) = setup().await;
        assert_eq!(feed.bootstrap().await.unwrap(), 3);

        assert_eq!(feed.page(150, 2).await.unwrap(), vec![3, 2]);
        assert_eq!(feed.page(0, 5).await.unwrap(), vec![3, 2, 1]);
        assert!(feed.page(300, 5).await.unwrap().is_empty());
        assert!(feed.page(0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_warms_records() {
        let (feed, store) = setup().await;
        feed.bootstrap().await.unwrap();
        feed.loader.get_video(2).await.unwrap();
        assert_eq!(store.stats().count(QueryKind::GetVideo), 0);
    }

    #[tokio::test]
    async fn test_append_and_page_size() {
        let (feed, _) = setup().await;
        feed.append(&video(9, 900)).await.unwrap();
        assert_eq!(feed.len().await.unwrap(), 1);
        assert_eq!(feed.page(0, 1).await.unwrap(), vec![9]);

        assert_eq!(feed.page_size(None), 5);
        assert_eq!(feed.page_size(Some(0)), 5);
        assert_eq!(feed.page_size(Some(500)), 50);
    }
}
