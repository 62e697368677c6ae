//! In-process cache with Redis-like data types, TTLs and pub/sub.
//!
//! Used for single-instance deployments and as the test double for Redis.
//! Every operation runs under one state lock, so multi-step scripts executed
//! through [`LocalCache::with_state`] are atomic exactly like Lua on Redis.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::error::CacheError;

/// Capacity of each local pub/sub channel. Slow subscribers lose the oldest
/// messages, matching Redis' fire-and-forget delivery.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    /// member -> score
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

fn wrong_type() -> CacheError {
    CacheError::Command(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

/// Keyspace of the local cache.
#[derive(Debug, Default)]
pub struct LocalState {
    entries: HashMap<String, Entry>,
}

impl LocalState {
    fn purge_if_expired(&mut self, key: &str) {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn entry_or_insert(&mut self, key: &str, make: fn() -> Value) -> &mut Entry {
        self.purge_if_expired(key);
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: make(),
            expires_at: None,
        })
    }

    fn hash_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut HashMap<String, String>>, CacheError> {
        let entry = if create {
            Some(self.entry_or_insert(key, || Value::Hash(HashMap::new())))
        } else {
            self.entry(key)
        };
        match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut HashSet<String>>, CacheError> {
        let entry = if create {
            Some(self.entry_or_insert(key, || Value::Set(HashSet::new())))
        } else {
            self.entry(key)
        };
        match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn zset_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut HashMap<String, f64>>, CacheError> {
        let entry = if create {
            Some(self.entry_or_insert(key, || Value::ZSet(HashMap::new())))
        } else {
            self.entry(key)
        };
        match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Drops the key if its collection became empty, as Redis does.
    fn remove_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Set(s)) => s.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            Some(Value::Hash(h)) => h.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    pub fn del(&mut self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.entries.remove(key).is_some()
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.entry(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    /// Remaining time to live; `None` if the key is missing or persistent.
    pub fn ttl(&mut self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entry(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        Ok(self.hash_mut(key, false)?.cloned().unwrap_or_default())
    }

    pub fn hset(&mut self, key: &str, fields: &[(String, String)]) -> Result<(), CacheError> {
        if let Some(hash) = self.hash_mut(key, true)? {
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
        }
        Ok(())
    }

    pub fn hexists(&mut self, key: &str, field: &str) -> Result<bool, CacheError> {
        Ok(self
            .hash_mut(key, false)?
            .is_some_and(|h| h.contains_key(field)))
    }

    pub fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        let Some(hash) = self.hash_mut(key, true)? else {
            return Ok(0);
        };
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                CacheError::Command("ERR hash value is not an integer".to_string())
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    pub fn sadd(&mut self, key: &str, members: &[String]) -> Result<usize, CacheError> {
        if members.is_empty() {
            return Ok(0);
        }
        let Some(set) = self.set_mut(key, true)? else {
            return Ok(0);
        };
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count())
    }

    pub fn srem(&mut self, key: &str, member: &str) -> Result<bool, CacheError> {
        let removed = match self.set_mut(key, false)? {
            Some(set) => set.remove(member),
            None => false,
        };
        self.remove_if_empty(key);
        Ok(removed)
    }

    pub fn sismember(&mut self, key: &str, member: &str) -> Result<bool, CacheError> {
        Ok(self.set_mut(key, false)?.is_some_and(|s| s.contains(member)))
    }

    pub fn smembers(&mut self, key: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .set_mut(key, false)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn scard(&mut self, key: &str) -> Result<usize, CacheError> {
        Ok(self.set_mut(key, false)?.map_or(0, |s| s.len()))
    }

    pub fn zadd(&mut self, key: &str, items: &[(f64, String)]) -> Result<usize, CacheError> {
        if items.is_empty() {
            return Ok(0);
        }
        let Some(zset) = self.zset_mut(key, true)? else {
            return Ok(0);
        };
        let mut added = 0;
        for (score, member) in items {
            if zset.insert(member.clone(), *score).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn zrem(&mut self, key: &str, member: &str) -> Result<bool, CacheError> {
        let removed = match self.zset_mut(key, false)? {
            Some(zset) => zset.remove(member).is_some(),
            None => false,
        };
        self.remove_if_empty(key);
        Ok(removed)
    }

    pub fn zcard(&mut self, key: &str) -> Result<usize, CacheError> {
        Ok(self.zset_mut(key, false)?.map_or(0, |z| z.len()))
    }

    /// Members with `score > min_exclusive`, highest score first.
    /// Ties are ordered by member, descending, like `ZREVRANGEBYSCORE`.
    pub fn zrevrange_by_score(
        &mut self,
        key: &str,
        min_exclusive: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, CacheError> {
        let Some(zset) = self.zset_mut(key, false)? else {
            return Ok(Vec::new());
        };
        let mut items: Vec<(&String, f64)> = zset
            .iter()
            .filter(|(_, score)| **score > min_exclusive)
            .map(|(m, s)| (m, *s))
            .collect();
        items.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(a.0)));
        let limit = limit.unwrap_or(usize::MAX);
        Ok(items.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    pub fn set_nx(&mut self, key: &str, value: &str, ttl: Duration) -> bool {
        if self.exists(key) {
            return false;
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        true
    }

    pub fn get_string(&mut self, key: &str) -> Result<Option<String>, CacheError> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Drops every expired key. Returns how many were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.expires_at.is_none_or(|at| at > now));
        before - self.entries.len()
    }

    /// Number of live keys.
    pub fn len(&mut self) -> usize {
        self.cleanup_expired();
        self.entries.len()
    }
}

/// Local cache: keyspace plus broadcast-based pub/sub.
#[derive(Debug)]
pub struct LocalCache {
    state: Mutex<LocalState>,
    channels: DashMap<String, broadcast::Sender<String>>,
    op_timeout: Duration,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl LocalCache {
    pub fn new(op_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            channels: DashMap::new(),
            op_timeout,
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Runs `f` with exclusive access to the keyspace.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut LocalState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Publishes to current subscribers. Returns how many received it; with no
    /// subscriber the message is simply lost.
    pub fn publish(&self, channel: &str, payload: String) -> usize {
        match self.channels.get(channel) {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Removes expired keys. Lookups only purge the key they touch, so ids
    /// read once would otherwise stay resident.
    pub fn cleanup_expired(&self) -> usize {
        self.with_state(LocalState::cleanup_expired)
    }

    /// Spawns a task that runs [`cleanup_expired`](Self::cleanup_expired)
    /// every `interval` until aborted.
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Local cache cleanup completed");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.with_state(|s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
