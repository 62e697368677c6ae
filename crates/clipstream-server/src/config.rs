use clipstream_db_postgres::PostgresConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Cache TTLs, lock expiry and operation timeout
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub writeback: WriteBackConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Cache validations
        if self.cache.op_timeout_ms == 0 {
            return Err("cache.op_timeout_ms must be > 0".into());
        }
        if self.cache.entity_ttl_secs == 0 || self.cache.set_ttl_secs == 0 {
            return Err("cache TTLs must be > 0".into());
        }
        if self.cache.negative_ttl_secs == 0 {
            return Err("cache.negative_ttl_secs must be > 0".into());
        }
        if self.cache.lock_ttl_secs == 0 {
            return Err("cache.lock_ttl_secs must be > 0".into());
        }
        if self.cache.local_cleanup_interval_secs == 0 {
            return Err("cache.local_cleanup_interval_secs must be > 0".into());
        }
        // Feed validations
        if self.feed.default_page_size == 0 {
            return Err("feed.default_page_size must be > 0".into());
        }
        if self.feed.default_page_size > self.feed.max_page_size {
            return Err("feed.default_page_size must be <= feed.max_page_size".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Storage validation
        if self.storage.backend == StorageBackend::Postgres {
            if self.storage.postgres.url.is_empty() {
                return Err("storage.postgres.url must not be empty".into());
            }
            if self.storage.postgres.pool_size == 0 {
                return Err("storage.postgres.pool_size must be > 0".into());
            }
        }
        if self.redis.enabled && self.redis.url.is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.media.public_base_url.is_empty() {
            return Err("media.public_base_url must not be empty".into());
        }
        if self.reconcile.enabled && self.reconcile.interval_secs == 0 {
            return Err("reconcile.interval_secs must be > 0 when enabled".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (disabled for single-instance deployments)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process tables; data is lost on exit.
    Memory,
    #[default]
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound for every cache call, in milliseconds
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Base TTL of cached entity records
    #[serde(default = "default_entity_ttl_secs")]
    pub entity_ttl_secs: u64,

    /// Random extra TTL in `[0, jitter]` added per record
    #[serde(default = "default_entity_ttl_jitter_secs")]
    pub entity_ttl_jitter_secs: u64,

    /// TTL of negative-cache entries
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,

    /// TTL of rebuilt membership sets
    #[serde(default = "default_set_ttl_secs")]
    pub set_ttl_secs: u64,

    /// Safety expiry of rebuild locks
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// How often the in-process cache drops expired keys nobody touches again
    #[serde(default = "default_local_cleanup_interval_secs")]
    pub local_cleanup_interval_secs: u64,
}

fn default_op_timeout_ms() -> u64 {
    1000
}
fn default_entity_ttl_secs() -> u64 {
    300
}
fn default_entity_ttl_jitter_secs() -> u64 {
    5
}
fn default_negative_ttl_secs() -> u64 {
    30
}
fn default_set_ttl_secs() -> u64 {
    600
}
fn default_lock_ttl_secs() -> u64 {
    10
}
fn default_local_cleanup_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: default_op_timeout_ms(),
            entity_ttl_secs: default_entity_ttl_secs(),
            entity_ttl_jitter_secs: default_entity_ttl_jitter_secs(),
            negative_ttl_secs: default_negative_ttl_secs(),
            set_ttl_secs: default_set_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            local_cleanup_interval_secs: default_local_cleanup_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_secs)
    }
    pub fn entity_ttl_jitter(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_jitter_secs)
    }
    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
    pub fn set_ttl(&self) -> Duration {
        Duration::from_secs(self.set_ttl_secs)
    }
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
    pub fn local_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.local_cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Scan the durable store into the feed index at startup
    #[serde(default = "default_bootstrap_on_start")]
    pub bootstrap_on_start: bool,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_bootstrap_on_start() -> bool {
    true
}
fn default_page_size() -> usize {
    5
}
fn default_max_page_size() -> usize {
    50
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            bootstrap_on_start: default_bootstrap_on_start(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory blobs are written under
    #[serde(default = "default_media_root")]
    pub root_dir: PathBuf,
    /// Public URL prefix for stored blobs
    #[serde(default = "default_media_base_url")]
    pub public_base_url: String,
}

fn default_media_root() -> PathBuf {
    PathBuf::from("./media")
}
fn default_media_base_url() -> String {
    "http://localhost:8080/media".to_string()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root_dir: default_media_root(),
            public_base_url: default_media_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBackConfig {
    /// Run the write-back consumers in this process
    #[serde(default = "default_writeback_enabled")]
    pub enabled: bool,
    /// Reconnect backoff ceiling
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_writeback_enabled() -> bool {
    true
}
fn default_max_backoff_secs() -> u64 {
    300
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            enabled: default_writeback_enabled(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Write cached counters that are ahead of the store back to the store
    #[serde(default)]
    pub repair_store: bool,
}

fn default_reconcile_interval_secs() -> u64 {
    900
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_reconcile_interval_secs(),
            repair_store: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Serve a Prometheus scrape endpoint on this address
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("clipstream.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., CLIPSTREAM__CACHE__ENTITY_TTL_SECS=120
        builder = builder.add_source(
            Environment::with_prefix("CLIPSTREAM")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
