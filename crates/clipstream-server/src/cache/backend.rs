//! Cache backend facade over the local and Redis implementations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio_stream::wrappers::BroadcastStream;

use super::error::CacheError;
use super::local::LocalCache;
use super::redis::RedisCache;
use super::script::{Script, ScriptOutcome};

/// Cache backend used by every component of the consistency layer.
///
/// ## Cache Modes
///
/// - **Local**: Single-instance mode, in-process keyspace and broadcast pub/sub
/// - **Redis**: Multi-instance mode, shared keyspace and Redis pub/sub
///
/// Every call is bounded by the backend's operation timeout; an elapsed call
/// yields [`CacheError::Timeout`].
#[derive(Clone, Debug)]
pub enum CacheBackend {
    /// Single-instance: in-process cache
    Local(Arc<LocalCache>),

    /// Multi-instance: Redis
    Redis(RedisCache),
}

impl CacheBackend {
    /// Create a new local-only cache backend with the default timeout.
    pub fn new_local() -> Self {
        CacheBackend::Local(Arc::new(LocalCache::default()))
    }

    pub fn new_local_with_timeout(op_timeout: Duration) -> Self {
        CacheBackend::Local(Arc::new(LocalCache::new(op_timeout)))
    }

    /// Create a new Redis-backed cache backend.
    pub fn new_redis(pool: Pool, url: impl Into<String>, op_timeout: Duration) -> Self {
        CacheBackend::Redis(RedisCache::new(pool, url, op_timeout))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            CacheBackend::Local(_) => "local",
            CacheBackend::Redis(_) => "redis",
        }
    }

    /// Get the local cache reference (for testing/internal use).
    pub fn local_cache(&self) -> Option<&Arc<LocalCache>> {
        match self {
            CacheBackend::Local(local) => Some(local),
            CacheBackend::Redis(_) => None,
        }
    }

    /// Check if Redis is reachable (for health checks).
    pub async fn is_redis_available(&self) -> bool {
        match self {
            CacheBackend::Local(_) => false,
            CacheBackend::Redis(redis) => redis.ping().await,
        }
    }

    fn op_timeout(&self) -> Duration {
        match self {
            CacheBackend::Local(local) => local.op_timeout(),
            CacheBackend::Redis(redis) => redis.op_timeout(),
        }
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        let limit = self.op_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op = %op, timeout_ms = limit.as_millis() as u64, "Cache operation timed out");
                crate::metrics::record_cache_timeout(op);
                Err(CacheError::Timeout { op, elapsed: limit })
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.timed("exists", async {
            match self {
                CacheBackend::Local(local) => Ok(local.with_state(|s| s.exists(key))),
                CacheBackend::Redis(redis) => redis.exists(key).await,
            }
        })
        .await
    }

    pub async fn del(&self, key: &str) -> Result<bool, CacheError> {
        self.timed("del", async {
            match self {
                CacheBackend::Local(local) => Ok(local.with_state(|s| s.del(key))),
                CacheBackend::Redis(redis) => redis.del(key).await,
            }
        })
        .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.timed("expire", async {
            match self {
                CacheBackend::Local(local) => Ok(local.with_state(|s| s.expire(key, ttl))),
                CacheBackend::Redis(redis) => redis.expire(key, ttl).await,
            }
        })
        .await
    }

    /// All fields of the hash at `key`; empty when the key is missing.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        self.timed("hgetall", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.hgetall(key)),
                CacheBackend::Redis(redis) => redis.hgetall(key).await,
            }
        })
        .await
    }

    /// Replaces the hash at `key` with exactly `fields` and sets its TTL.
    pub async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.timed("hset_all", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| -> Result<(), CacheError> {
                    s.del(key);
                    if !fields.is_empty() {
                        s.hset(key, fields)?;
                        s.expire(key, ttl);
                    }
                    Ok(())
                }),
                CacheBackend::Redis(redis) => redis.hset_all(key, fields, ttl).await,
            }
        })
        .await
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, CacheError> {
        self.timed("sadd", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.sadd(key, members)),
                CacheBackend::Redis(redis) => redis.sadd(key, members).await,
            }
        })
        .await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.timed("srem", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.srem(key, member)),
                CacheBackend::Redis(redis) => redis.srem(key, member).await,
            }
        })
        .await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.timed("sismember", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.sismember(key, member)),
                CacheBackend::Redis(redis) => redis.sismember(key, member).await,
            }
        })
        .await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.timed("smembers", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.smembers(key)),
                CacheBackend::Redis(redis) => redis.smembers(key).await,
            }
        })
        .await
    }

    /// Raw cardinality, placeholder included.
    pub async fn scard(&self, key: &str) -> Result<usize, CacheError> {
        self.timed("scard", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.scard(key)),
                CacheBackend::Redis(redis) => redis.scard(key).await,
            }
        })
        .await
    }

    pub async fn zadd(&self, key: &str, items: &[(f64, String)]) -> Result<usize, CacheError> {
        self.timed("zadd", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.zadd(key, items)),
                CacheBackend::Redis(redis) => redis.zadd(key, items).await,
            }
        })
        .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.timed("zrem", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.zrem(key, member)),
                CacheBackend::Redis(redis) => redis.zrem(key, member).await,
            }
        })
        .await
    }

    /// Every member, highest score first.
    pub async fn zrevrange_all(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.zrevrange_by_score(key, f64::NEG_INFINITY, None).await
    }

    /// Members scored strictly above `min_exclusive`, highest first, at most `limit`.
    pub async fn zrevrange_by_score(
        &self,
        key: &str,
        min_exclusive: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, CacheError> {
        self.timed("zrevrange_by_score", async {
            match self {
                CacheBackend::Local(local) => {
                    local.with_state(|s| s.zrevrange_by_score(key, min_exclusive, limit))
                }
                CacheBackend::Redis(redis) => {
                    redis.zrevrange_by_score(key, min_exclusive, limit).await
                }
            }
        })
        .await
    }

    pub async fn zcard(&self, key: &str) -> Result<usize, CacheError> {
        self.timed("zcard", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| s.zcard(key)),
                CacheBackend::Redis(redis) => redis.zcard(key).await,
            }
        })
        .await
    }

    /// Set-if-absent with expiry. Returns whether this call created the key.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.timed("set_nx_ex", async {
            match self {
                CacheBackend::Local(local) => Ok(local.with_state(|s| s.set_nx(key, value, ttl))),
                CacheBackend::Redis(redis) => redis.set_nx_ex(key, value, ttl).await,
            }
        })
        .await
    }

    /// Deletes `key` only if it still holds `token`.
    pub async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        self.timed("release_lock", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| -> Result<bool, CacheError> {
                    if s.get_string(key)?.as_deref() == Some(token) {
                        Ok(s.del(key))
                    } else {
                        Ok(false)
                    }
                }),
                CacheBackend::Redis(redis) => redis.release_lock(key, token).await,
            }
        })
        .await
    }

    /// Atomically replaces the set at `key` with `members` and sets its TTL.
    pub async fn rebuild_set(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.timed("rebuild_set", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| -> Result<(), CacheError> {
                    s.del(key);
                    s.sadd(key, members)?;
                    s.expire(key, ttl);
                    Ok(())
                }),
                CacheBackend::Redis(redis) => redis.rebuild_set(key, members, ttl).await,
            }
        })
        .await
    }

    /// Atomically replaces the sorted set at `key` with `items` and sets its TTL.
    pub async fn rebuild_zset(
        &self,
        key: &str,
        items: &[(f64, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.timed("rebuild_zset", async {
            match self {
                CacheBackend::Local(local) => local.with_state(|s| -> Result<(), CacheError> {
                    s.del(key);
                    s.zadd(key, items)?;
                    s.expire(key, ttl);
                    Ok(())
                }),
                CacheBackend::Redis(redis) => redis.rebuild_zset(key, items, ttl).await,
            }
        })
        .await
    }

    /// Runs an atomic script and maps its status code.
    pub async fn run_script(&self, script: &Script) -> Result<ScriptOutcome, CacheError> {
        let name = script.name();
        let status = self
            .timed(name, async {
                match self {
                    CacheBackend::Local(local) => local.with_state(|s| -> Result<i64, CacheError> {
                        let (status, publication) = script.run_local(s)?;
                        if let Some((channel, payload)) = publication {
                            local.publish(channel, payload);
                        }
                        Ok(status)
                    }),
                    CacheBackend::Redis(redis) => redis.run_script(script).await,
                }
            })
            .await?;

        let outcome = ScriptOutcome::from_status(name, status)?;
        crate::metrics::record_script_outcome(name, outcome.as_str());
        tracing::debug!(script = %name, outcome = %outcome.as_str(), "Cache script ran");
        Ok(outcome)
    }

    /// Publishes `payload`; returns the number of subscribers that got it.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize, CacheError> {
        self.timed("publish", async {
            match self {
                CacheBackend::Local(local) => Ok(local.publish(channel, payload.to_string())),
                CacheBackend::Redis(redis) => redis.publish(channel, payload).await,
            }
        })
        .await
    }

    /// Subscribes to `channel`. Messages published after this returns are
    /// delivered; the stream ends when the underlying connection is lost.
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        match self {
            CacheBackend::Local(local) => {
                let receiver = local.subscribe(channel);
                let channel = channel.to_string();
                let stream = BroadcastStream::new(receiver).filter_map(move |msg| {
                    let channel = channel.clone();
                    async move {
                        match msg {
                            Ok(payload) => Some(payload),
                            Err(e) => {
                                tracing::warn!(channel = %channel, error = %e, "Subscriber lagged, messages lost");
                                None
                            }
                        }
                    }
                });
                Ok(stream.boxed())
            }
            CacheBackend::Redis(redis) => self.timed("subscribe", redis.subscribe(channel)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hset_all_replaces_fields() {
        let cache = CacheBackend::new_local();
        let ttl = Duration::from_secs(60);
        cache
            .hset_all("video:1", &[("__absent".into(), "1".into())], ttl)
            .await
            .unwrap();
        cache
            .hset_all("video:1", &[("title".into(), "x".into())], ttl)
            .await
            .unwrap();
        let fields = cache.hgetall("video:1").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["title"], "x");
    }

    #[tokio::test]
    async fn test_release_lock_compares_token() {
        let cache = CacheBackend::new_local();
        let ttl = Duration::from_secs(10);
        assert!(cache.set_nx_ex("lock:k", "mine", ttl).await.unwrap());
        assert!(!cache.set_nx_ex("lock:k", "other", ttl).await.unwrap());
        assert!(!cache.release_lock("lock:k", "other").await.unwrap());
        assert!(cache.exists("lock:k").await.unwrap());
        assert!(cache.release_lock("lock:k", "mine").await.unwrap());
        assert!(!cache.exists("lock:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_set_replaces_members() {
        let cache = CacheBackend::new_local();
        let ttl = Duration::from_secs(60);
        cache.sadd("s", &["stale".to_string()]).await.unwrap();
        cache
            .rebuild_set("s", &[String::new(), "1".to_string()], ttl)
            .await
            .unwrap();
        let mut members = cache.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec![String::new(), "1".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_receives_published() {
        let cache = CacheBackend::new_local();
        let mut stream = cache.subscribe("chan").await.unwrap();
        assert_eq!(cache.publish("chan", "hello").await.unwrap(), 1);
        assert_eq!(stream.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_zrevrange_all_orders_by_score() {
        let cache = CacheBackend::new_local();
        cache
            .zadd("z", &[(1.0, "a".into()), (3.0, "c".into()), (2.0, "b".into())])
            .await
            .unwrap();
        assert_eq!(cache.zrevrange_all("z").await.unwrap(), vec!["c", "b", "a"]);
        assert_eq!(cache.zcard("z").await.unwrap(), 3);
    }
}
