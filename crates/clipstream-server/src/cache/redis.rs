//! Redis-backed cache: pooled commands plus a dedicated pub/sub client.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use deadpool_redis::{Connection, Pool};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::AsyncCommands;

use super::error::CacheError;
use super::script::{
    APPEND_COMMENT_LUA, APPEND_VIDEO_LUA, REMOVE_COMMENT_LUA, Script, TOGGLE_FOLLOW_LUA,
    TOGGLE_LIKE_LUA,
};

/// Deletes a lock only if it still holds the caller's token.
const RELEASE_LOCK_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

static RELEASE_LOCK: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(RELEASE_LOCK_LUA));
static TOGGLE_LIKE: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(TOGGLE_LIKE_LUA));
static TOGGLE_FOLLOW: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(TOGGLE_FOLLOW_LUA));
static APPEND_COMMENT: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(APPEND_COMMENT_LUA));
static REMOVE_COMMENT: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(REMOVE_COMMENT_LUA));
static APPEND_VIDEO: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(APPEND_VIDEO_LUA));

fn compiled(script: &Script) -> &'static redis::Script {
    match script {
        Script::ToggleLike { .. } => &TOGGLE_LIKE,
        Script::ToggleFollow { .. } => &TOGGLE_FOLLOW,
        Script::AppendComment { .. } => &APPEND_COMMENT,
        Script::RemoveComment { .. } => &REMOVE_COMMENT,
        Script::AppendVideo { .. } => &APPEND_VIDEO,
    }
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Redis cache handle. Cloning shares the pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    url: String,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    pub fn new(pool: Pool, url: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            pool,
            url: url.into(),
            op_timeout,
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        Ok(self.pool.get().await?)
    }

    pub async fn ping(&self) -> bool {
        match self.conn().await {
            Ok(mut conn) => {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
            Err(_) => false,
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists::<_, bool>(key).await?)
    }

    pub async fn del(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.del::<_, i64>(key).await? > 0)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.pexpire::<_, bool>(key, millis(ttl)).await?)
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall::<_, HashMap<String, String>>(key).await?)
    }

    /// Replaces the hash at `key` with `fields` and sets its TTL, atomically.
    pub async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
            pipe.pexpire(key, millis(ttl)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, CacheError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.sadd::<_, _, usize>(key, members).await?)
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.srem::<_, _, i64>(key, member).await? > 0)
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.sismember::<_, _, bool>(key, member).await?)
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers::<_, Vec<String>>(key).await?)
    }

    pub async fn scard(&self, key: &str) -> Result<usize, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.scard::<_, usize>(key).await?)
    }

    pub async fn zadd(&self, key: &str, items: &[(f64, String)]) -> Result<usize, CacheError> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.zadd_multiple::<_, f64, String, usize>(key, items).await?)
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.zrem::<_, _, i64>(key, member).await? > 0)
    }

    pub async fn zcard(&self, key: &str) -> Result<usize, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard::<_, usize>(key).await?)
    }

    /// `ZREVRANGEBYSCORE key +inf (min LIMIT 0 limit`.
    pub async fn zrevrange_by_score(
        &self,
        key: &str,
        min_exclusive: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        let min = if min_exclusive == f64::NEG_INFINITY {
            "-inf".to_string()
        } else {
            format!("({min_exclusive}")
        };
        let members = match limit {
            Some(limit) => {
                let count = isize::try_from(limit).unwrap_or(isize::MAX);
                conn.zrevrangebyscore_limit::<_, _, _, Vec<String>>(key, "+inf", min, 0, count)
                    .await?
            }
            None => {
                conn.zrevrangebyscore::<_, _, _, Vec<String>>(key, "+inf", min)
                    .await?
            }
        };
        Ok(members)
    }

    /// `SET key value NX PX ttl`. Returns whether the key was set.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = RELEASE_LOCK.key(key).arg(token).invoke_async(&mut conn).await?;
        Ok(deleted == 1)
    }

    /// Atomically replaces the collection at `key` and sets its TTL.
    pub async fn rebuild_set(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            pipe.sadd(key, members).ignore();
            pipe.pexpire(key, millis(ttl)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn rebuild_zset(
        &self,
        key: &str,
        items: &[(f64, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !items.is_empty() {
            pipe.zadd_multiple(key, items).ignore();
            pipe.pexpire(key, millis(ttl)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn run_script(&self, script: &Script) -> Result<i64, CacheError> {
        let mut conn = self.conn().await?;
        let mut invocation = compiled(script).prepare_invoke();
        for key in script.keys() {
            invocation.key(key);
        }
        for arg in script.args() {
            invocation.arg(arg);
        }
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.publish::<_, _, usize>(channel, payload).await?)
    }

    /// Opens a dedicated pub/sub connection subscribed to `channel`.
    /// The subscription is confirmed before this returns.
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        let client = redis::Client::open(self.url.clone())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        tracing::info!(channel = %channel, "Subscribed to Redis channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
