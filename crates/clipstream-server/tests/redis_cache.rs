//! Integration tests against a real Redis.
//!
//! These exercise the Lua scripts, the lock and pub/sub delivery on Redis.
//! They need Docker for testcontainers and are ignored by default:
//! `cargo test -p clipstream-server --test redis_cache -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use clipstream_db_memory::{InMemoryMediaStore, InMemoryStore, QueryKind};
use clipstream_server::{
    CacheBackend, CounterEngine, CoreError, RedisConfig, RebuildLock, TtlPolicy,
    WriteBackPipeline, create_cache_backend,
};
use clipstream_storage::{DurableStore, User, Video};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_backend() -> CacheBackend {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 5,
        timeout_ms: 5000,
    };
    let cache = create_cache_backend(&config, Duration::from_secs(2)).await;
    assert_eq!(cache.mode(), "redis");
    cache
}

/// Each test uses its own id range so they can share one Redis.
async fn seeded_store(base: i64) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for id in [base + 1, base + 2] {
        store
            .seed_user(User {
                id,
                username: format!("user{id}"),
                nickname: String::new(),
                avatar_url: String::new(),
                background_img_url: String::new(),
            })
            .await;
    }
    store
        .seed_video(Video {
            id: base + 42,
            author_id: base + 2,
            title: "clip".into(),
            play_url: String::new(),
            cover_url: String::new(),
            like_count: 5,
            comment_count: 0,
            publish_at_ms: 1_000,
        })
        .await;
    store
}

fn engine(cache: CacheBackend, store: Arc<InMemoryStore>) -> CounterEngine {
    CounterEngine::new(
        cache,
        store,
        Arc::new(InMemoryMediaStore::default()),
        TtlPolicy::default(),
    )
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_connection() {
    let cache = redis_backend().await;
    assert!(cache.is_redis_available().await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_like_scenario() {
    let cache = redis_backend().await;
    let store = seeded_store(1_000).await;
    let engine = engine(cache.clone(), store.clone());
    let handle = WriteBackPipeline::new(cache, store.clone())
        .spawn_all()
        .await
        .unwrap();

    engine.like(1_001, 1_042).await.unwrap();
    assert!(matches!(
        engine.like(1_001, 1_042).await.unwrap_err(),
        CoreError::AlreadyApplied { .. }
    ));
    assert_eq!(engine.like_count(1_042).await.unwrap(), 6);
    assert_eq!(store.stats().count(QueryKind::LikedVideoIds), 1);

    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.stats().processed() < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("write-back applied");
    assert_eq!(store.get_video(1_042).await.unwrap().unwrap().like_count, 6);
    handle.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_follow_and_comments() {
    let cache = redis_backend().await;
    let store = seeded_store(2_000).await;
    let engine = engine(cache, store);

    assert_eq!(engine.follower_count(2_002).await.unwrap(), 0);
    engine.follow(2_001, 2_002).await.unwrap();
    assert!(engine.is_following(2_001, 2_002).await.unwrap());
    assert_eq!(engine.follower_count(2_002).await.unwrap(), 1);

    let comment = engine.add_comment(2_001, 2_042, "hi").await.unwrap();
    assert_eq!(engine.loader().get_video(2_042).await.unwrap().comment_count, 1);
    engine.delete_comment(2_001, 2_042, comment.id).await.unwrap();
    assert!(matches!(
        engine.delete_comment(2_001, 2_042, comment.id).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_lock_is_exclusive() {
    let cache = redis_backend().await;
    let lock = RebuildLock::new(cache.clone());
    let ttl = Duration::from_secs(10);

    assert!(cache.set_nx_ex("lock:user_likes:3001", "other", ttl).await.unwrap());
    let err = lock
        .with_rebuild_lock("user_likes:3001", ttl, async { Ok::<_, CoreError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::LockBusy { .. }));

    // Someone else's token is not released.
    assert!(!cache.release_lock("lock:user_likes:3001", "mine").await.unwrap());
    assert!(cache.release_lock("lock:user_likes:3001", "other").await.unwrap());
}
