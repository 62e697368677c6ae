pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod loader;
pub mod lock;
pub mod media;
pub mod metrics;
pub mod observability;
pub mod rebuild;
pub mod reconcile;
pub mod services;
pub mod writeback;

use std::sync::Arc;
use std::time::Duration;

use clipstream_storage::{DynDurableStore, DynMediaStore, StorageError};
use tokio::task::JoinHandle;

pub use cache::{CacheBackend, CacheError, Script, ScriptOutcome, Toggle};
pub use config::{AppConfig, CacheConfig, RedisConfig, StorageBackend, StorageConfig};
pub use engine::CounterEngine;
pub use error::{CoreError, CoreResult};
pub use feed::FeedIndex;
pub use loader::{EntityKind, EntityLoader, TtlPolicy};
pub use lock::RebuildLock;
pub use media::FsMediaStore;
pub use observability::init_tracing;
pub use rebuild::{OwnerSet, SetRebuilder};
pub use reconcile::{ReconcileResult, Reconciler};
pub use services::{CommentInfo, UserInfo, UserService, VideoInfo, VideoService};
pub use writeback::{WriteBackHandle, WriteBackMessage, WriteBackPipeline};

/// Create a cache backend based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: Returns the in-process cache
/// - **Redis enabled**: Attempts to connect to Redis, falls back to the
///   in-process cache on failure
///
/// The in-process cache is only consistent within one process, so the
/// fallback suits single-instance deployments and local development.
pub async fn create_cache_backend(config: &RedisConfig, op_timeout: Duration) -> CacheBackend {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return CacheBackend::new_local_with_timeout(op_timeout);
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return CacheBackend::new_local_with_timeout(op_timeout);
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis");
            CacheBackend::new_redis(pool, config.url.clone(), op_timeout)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            CacheBackend::new_local_with_timeout(op_timeout)
        }
    }
}

/// Create the durable store selected by `storage.backend`.
pub async fn create_durable_store(config: &StorageConfig) -> Result<DynDurableStore, StorageError> {
    let store: DynDurableStore = match config.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory durable store, data is lost on exit");
            clipstream_db_memory::create_durable_store()
        }
        StorageBackend::Postgres => clipstream_db_postgres::create_store(config.postgres.clone()).await?,
    };
    tracing::info!(backend = store.backend_name(), "Durable store ready");
    Ok(store)
}

/// The assembled consistency layer.
#[derive(Clone)]
pub struct Clipstream {
    config: AppConfig,
    cache: CacheBackend,
    store: DynDurableStore,
    engine: CounterEngine,
    feed: FeedIndex,
    videos: VideoService,
}

impl Clipstream {
    pub fn new(
        config: AppConfig,
        cache: CacheBackend,
        store: DynDurableStore,
        media: DynMediaStore,
    ) -> Self {
        let ttl = TtlPolicy::from_config(&config.cache);
        let engine = CounterEngine::new(cache.clone(), store.clone(), media, ttl);
        let feed = FeedIndex::new(cache.clone(), store.clone(), engine.loader().clone())
            .with_config(&config.feed);
        let engine = engine.with_feed(feed.clone());
        let videos = VideoService::new(engine.clone(), feed.clone());
        Self {
            config,
            cache,
            store,
            engine,
            feed,
            videos,
        }
    }

    /// Connects the cache and the durable store described by `config`.
    pub async fn from_config(config: AppConfig) -> Result<Self, StorageError> {
        let cache = create_cache_backend(&config.redis, config.cache.op_timeout()).await;
        let store = create_durable_store(&config.storage).await?;
        let media: DynMediaStore = Arc::new(FsMediaStore::from_config(&config.media));
        Ok(Self::new(config, cache, store, media))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheBackend {
        &self.cache
    }

    pub fn store(&self) -> &DynDurableStore {
        &self.store
    }

    pub fn engine(&self) -> &CounterEngine {
        &self.engine
    }

    pub fn feed(&self) -> &FeedIndex {
        &self.feed
    }

    pub fn videos(&self) -> &VideoService {
        &self.videos
    }

    pub fn users(&self) -> &UserService {
        self.videos.users()
    }

    /// Bootstraps the feed and starts the enabled background workers.
    pub async fn start(&self) -> Result<BackgroundTasks, CoreError> {
        if self.config.feed.bootstrap_on_start {
            self.feed.bootstrap().await?;
        }

        let writeback = if self.config.writeback.enabled {
            let pipeline = WriteBackPipeline::new(self.cache.clone(), self.store.clone())
                .with_max_backoff(Duration::from_secs(self.config.writeback.max_backoff_secs));
            Some(pipeline.spawn_all().await?)
        } else {
            tracing::warn!("Write-back consumers disabled in this process");
            None
        };

        let reconcile = if self.config.reconcile.enabled {
            let interval = Duration::from_secs(self.config.reconcile.interval_secs);
            tracing::info!(interval_secs = interval.as_secs(), "Reconcile sweep scheduled");
            Some(
                Reconciler::new(self.cache.clone(), self.store.clone())
                    .with_repair_store(self.config.reconcile.repair_store)
                    .spawn(interval),
            )
        } else {
            None
        };

        // Redis expires keys itself.
        let local_cleanup = self.cache.local_cache().map(|local| {
            Arc::clone(local).start_cleanup_task(self.config.cache.local_cleanup_interval())
        });

        Ok(BackgroundTasks {
            writeback,
            reconcile,
            local_cleanup,
        })
    }
}

/// Background workers started by [`Clipstream::start`].
pub struct BackgroundTasks {
    writeback: Option<WriteBackHandle>,
    reconcile: Option<JoinHandle<()>>,
    local_cleanup: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn writeback(&self) -> Option<&WriteBackHandle> {
        self.writeback.as_ref()
    }

    pub async fn shutdown(self) {
        for task in [self.reconcile, self.local_cleanup].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }
        if let Some(writeback) = self.writeback {
            writeback.shutdown().await;
        }
    }
}
