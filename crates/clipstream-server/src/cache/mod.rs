//! Cache primitive layer.
//!
//! ## Architecture
//!
//! - **Local**: in-process keyspace with Redis-like hashes, sets, sorted sets,
//!   TTLs and broadcast pub/sub. Single instance and tests.
//! - **Redis**: shared keyspace, Lua scripts and Redis pub/sub. Multi-instance.
//!
//! Multi-step mutations go through [`Script`], which both backends execute
//! atomically.
//!
//! ## Graceful Degradation
//!
//! If Redis is unavailable or disabled at startup, the server falls back to
//! local mode (see [`crate::create_cache_backend`]).

pub mod backend;
pub mod error;
pub mod keys;
pub mod local;
pub mod record;
pub mod redis;
pub mod script;

pub use backend::CacheBackend;
pub use error::CacheError;
pub use local::LocalCache;
pub use record::{ABSENT_FIELD, CacheRecord, Decoded};
pub use redis::RedisCache;
pub use script::{Script, ScriptOutcome, Toggle};
