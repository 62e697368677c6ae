//! End-to-end consistency tests on the in-process cache and the in-memory
//! durable store.

use std::sync::Arc;
use std::time::Duration;

use clipstream_db_memory::{InMemoryMediaStore, InMemoryStore, QueryKind};
use clipstream_server::writeback::CHANNELS;
use clipstream_server::{
    AppConfig, CacheBackend, Clipstream, CoreError, OwnerSet, WriteBackHandle, WriteBackPipeline,
};
use clipstream_storage::{DurableStore, User, Video};
use futures_util::StreamExt;
use futures_util::future::join_all;

fn user(id: i64) -> User {
    User {
        id,
        username: format!("user{id}"),
        nickname: format!("User {id}"),
        avatar_url: format!("http://media.test/avatar/{id}.jpg"),
        background_img_url: String::new(),
    }
}

fn video(id: i64, author_id: i64, like_count: i64, publish_at_ms: i64) -> Video {
    Video {
        id,
        author_id,
        title: format!("video {id}"),
        play_url: format!("http://media.test/video/{id}.mp4"),
        cover_url: format!("http://media.test/cover/{id}.jpg"),
        like_count,
        comment_count: 0,
        publish_at_ms,
    }
}

async fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.seed_user(user(1)).await;
    store.seed_user(user(2)).await;
    store.seed_video(video(42, 2, 5, 1_000)).await;
    store
}

fn app(store: Arc<InMemoryStore>, cache: CacheBackend) -> Clipstream {
    Clipstream::new(
        AppConfig::default(),
        cache,
        store,
        Arc::new(InMemoryMediaStore::new("http://media.test")),
    )
}

async fn wait_processed(handle: &WriteBackHandle, expected: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.stats().processed() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("write-back messages processed in time");
}

#[tokio::test]
async fn test_cold_get_matches_store() {
    let store = seeded_store().await;
    let app = app(store.clone(), CacheBackend::new_local());

    let direct = store.get_video(42).await.unwrap().unwrap();
    let loaded = app.engine().loader().get_video(42).await.unwrap();
    assert_eq!(loaded, direct);

    let direct_user = store.get_user(1).await.unwrap().unwrap();
    assert_eq!(app.engine().loader().get_user(1).await.unwrap(), direct_user);
}

#[tokio::test]
async fn test_absent_id_served_from_negative_cache() {
    let store = seeded_store().await;
    let app = app(store.clone(), CacheBackend::new_local());

    for _ in 0..5 {
        let err = app.engine().loader().get_video(404).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
    assert_eq!(store.stats().count(QueryKind::GetVideo), 1);
}

#[tokio::test]
async fn test_like_twice_counts_once() {
    let store = seeded_store().await;
    let app = app(store, CacheBackend::new_local());

    app.engine().like(1, 42).await.unwrap();
    let err = app.engine().like(1, 42).await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyApplied { .. }));
    assert_eq!(app.engine().like_count(42).await.unwrap(), 6);
}

#[tokio::test]
async fn test_like_then_unlike_restores_count() {
    let store = seeded_store().await;
    let app = app(store, CacheBackend::new_local());

    app.engine().like(1, 42).await.unwrap();
    app.engine().unlike(1, 42).await.unwrap();
    assert_eq!(app.engine().like_count(42).await.unwrap(), 5);
    assert!(!app.engine().has_liked(1, 42).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_reads_rebuild_once() {
    let store = seeded_store().await;
    store.seed_like(1, 42).await;
    let app = app(store.clone(), CacheBackend::new_local());

    // An open transaction stalls store reads, so every reader finds the
    // index cold while the first rebuild is still running.
    let stall = store.begin_transaction().await.unwrap();
    let reads: Vec<_> = (0..16)
        .map(|_| {
            let engine = app.engine().clone();
            tokio::spawn(async move { engine.has_liked(1, 42).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stall);

    for result in join_all(reads).await {
        assert!(result.unwrap().unwrap());
    }
    assert_eq!(store.stats().count(QueryKind::LikedVideoIds), 1);
}

#[tokio::test]
async fn test_engine_publishes_into_configured_feed() {
    let store = seeded_store().await;
    let mut config = AppConfig::default();
    config.feed.default_page_size = 2;
    config.feed.max_page_size = 3;
    let app = Clipstream::new(
        config,
        CacheBackend::new_local(),
        store,
        Arc::new(InMemoryMediaStore::new("http://media.test")),
    );

    assert_eq!(app.engine().feed().page_size(None), 2);
    assert_eq!(app.engine().feed().page_size(Some(100)), 3);

    app.feed().bootstrap().await.unwrap();
    let video = app
        .engine()
        .publish_video(1, "fresh", b"video".to_vec(), b"cover".to_vec())
        .await
        .unwrap();
    assert_eq!(app.feed().page(0, 2).await.unwrap(), vec![video.id, 42]);
}

#[tokio::test]
async fn test_pipeline_applies_like_to_store() {
    let store = seeded_store().await;
    let cache = CacheBackend::new_local();
    let app = app(store.clone(), cache.clone());
    let handle = WriteBackPipeline::new(cache, store.clone())
        .spawn_all()
        .await
        .unwrap();

    app.engine().like(1, 42).await.unwrap();
    wait_processed(&handle, 1).await;

    assert_eq!(handle.stats().applied(), 1);
    assert!(store.has_like_row(1, 42).await);
    assert_eq!(store.get_video(42).await.unwrap().unwrap().like_count, 6);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_stopped_consumer_leaves_store_unchanged() {
    let store = seeded_store().await;
    let cache = CacheBackend::new_local();
    let app = app(store.clone(), cache.clone());
    let handle = WriteBackPipeline::new(cache, store.clone())
        .spawn_all()
        .await
        .unwrap();
    handle.shutdown().await;

    app.engine().like(1, 42).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(app.engine().like_count(42).await.unwrap(), 6);
    assert!(!store.has_like_row(1, 42).await);
    assert_eq!(store.get_video(42).await.unwrap().unwrap().like_count, 5);
}

#[tokio::test]
async fn test_failed_transaction_is_dropped() {
    let store = seeded_store().await;
    let cache = CacheBackend::new_local();
    let app = app(store.clone(), cache.clone());
    let handle = WriteBackPipeline::new(cache, store.clone())
        .spawn_all()
        .await
        .unwrap();

    store.set_fail_commits(true);
    app.engine().like(1, 42).await.unwrap();
    wait_processed(&handle, 1).await;
    assert_eq!(handle.stats().dropped(), 1);
    assert_eq!(store.get_video(42).await.unwrap().unwrap().like_count, 5);

    // Later messages still flow.
    store.set_fail_commits(false);
    app.engine().follow(1, 2).await.unwrap();
    wait_processed(&handle, 2).await;
    assert!(store.has_follow_row(1, 2).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_feed_page_after_cursor() {
    let store = Arc::new(InMemoryStore::new());
    store.seed_user(user(1)).await;
    store.seed_video(video(1, 1, 0, 100)).await;
    store.seed_video(video(2, 1, 0, 200)).await;
    store.seed_video(video(3, 1, 0, 300)).await;
    let app = app(store, CacheBackend::new_local());
    app.feed().bootstrap().await.unwrap();

    assert_eq!(app.feed().page(150, 2).await.unwrap(), vec![3, 2]);

    let page = app.videos().feed(None, Some(150), Some(2)).await.unwrap();
    let ids: Vec<i64> = page.iter().map(|v| v.video.id).collect();
    assert_eq!(ids, vec![3, 2]);
}

#[tokio::test]
async fn test_like_scenario_end_to_end() {
    let store = seeded_store().await;
    let cache = CacheBackend::new_local();
    let app = app(store.clone(), cache.clone());

    // Observe the published message alongside the pipeline.
    let mut observed = cache.subscribe(CHANNELS[0]).await.unwrap();
    let handle = WriteBackPipeline::new(cache.clone(), store.clone())
        .spawn_all()
        .await
        .unwrap();

    assert!(!cache.exists(&OwnerSet::UserLikes(1).key()).await.unwrap());
    app.engine().like(1, 42).await.unwrap();

    assert_eq!(observed.next().await.as_deref(), Some("1:42:like"));
    assert_eq!(app.engine().like_count(42).await.unwrap(), 6);
    assert_eq!(store.stats().count(QueryKind::LikedVideoIds), 1);

    wait_processed(&handle, 1).await;
    assert_eq!(store.get_video(42).await.unwrap().unwrap().like_count, 6);

    let info = app
        .videos()
        .video_info(app.engine().loader().get_video(42).await.unwrap(), Some(1))
        .await
        .unwrap();
    assert!(info.is_liked);
    assert_eq!(info.video.like_count, 6);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_comment_delete_reaches_store() {
    let store = seeded_store().await;
    let cache = CacheBackend::new_local();
    let app = app(store.clone(), cache.clone());
    let handle = WriteBackPipeline::new(cache, store.clone())
        .spawn_all()
        .await
        .unwrap();

    let comment = app.engine().add_comment(1, 42, "hello").await.unwrap();
    assert_eq!(store.get_video(42).await.unwrap().unwrap().comment_count, 1);

    app.engine().delete_comment(1, 42, comment.id).await.unwrap();
    wait_processed(&handle, 1).await;

    assert_eq!(store.get_comment(comment.id).await.unwrap(), None);
    assert_eq!(store.get_video(42).await.unwrap().unwrap().comment_count, 0);
    assert!(app.videos().comments(42, None).await.unwrap().is_empty());
    handle.shutdown().await;
}

#[tokio::test]
async fn test_start_bootstraps_and_runs_workers() {
    let store = seeded_store().await;
    let app = app(store.clone(), CacheBackend::new_local());

    let tasks = app.start().await.unwrap();
    assert_eq!(app.feed().len().await.unwrap(), 1);
    let handle = tasks.writeback().expect("write-back enabled by default");
    assert!(handle.is_running());

    app.engine().follow(1, 2).await.unwrap();
    wait_processed(handle, 1).await;
    assert!(store.has_follow_row(1, 2).await);
    tasks.shutdown().await;
}
