//! The shipped `clipstream.toml` stays in sync with `AppConfig`.

use std::path::PathBuf;

use clipstream_server::config::loader::load_config;
use clipstream_server::{AppConfig, StorageBackend};

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../clipstream.toml")
}

#[test]
fn test_shipped_config_parses_and_validates() {
    let raw = std::fs::read_to_string(shipped_config()).expect("read clipstream.toml");
    let cfg: AppConfig = toml::from_str(&raw).expect("parse clipstream.toml");
    cfg.validate().expect("shipped config is valid");

    assert_eq!(cfg.storage.backend, StorageBackend::Postgres);
    assert!(!cfg.redis.enabled);
    assert_eq!(cfg.cache.lock_ttl_secs, 10);
    assert_eq!(cfg.metrics.listen_addr, None);
}

#[test]
fn test_shipped_config_matches_defaults() {
    let path = shipped_config();
    let loaded = load_config(Some(&path.to_string_lossy())).expect("load clipstream.toml");
    let defaults = AppConfig::default();

    assert_eq!(loaded.cache.entity_ttl(), defaults.cache.entity_ttl());
    assert_eq!(loaded.cache.negative_ttl(), defaults.cache.negative_ttl());
    assert_eq!(loaded.feed.max_page_size, defaults.feed.max_page_size);
    assert_eq!(loaded.writeback.max_backoff_secs, defaults.writeback.max_backoff_secs);
    assert_eq!(
        loaded.cache.local_cleanup_interval(),
        defaults.cache.local_cleanup_interval()
    );
    assert_eq!(
        loaded.storage.postgres.statement_timeout_ms,
        defaults.storage.postgres.statement_timeout_ms
    );
}
