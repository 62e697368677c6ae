//! Distributed rebuild lock.
//!
//! Guards expensive owner-set rebuilds so that a cache miss under load causes
//! one durable-store query rather than one per caller. The lock is
//! `lock:<ownerKey>`, taken with set-if-absent plus a safety expiry and held
//! under a random token; release deletes the key only if the token still
//! matches.

use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::{CacheBackend, keys};
use crate::error::CoreError;

#[derive(Clone, Debug)]
pub struct RebuildLock {
    cache: CacheBackend,
}

impl RebuildLock {
    pub fn new(cache: CacheBackend) -> Self {
        Self { cache }
    }

    /// Runs `rebuild` while holding `lock:<owner_key>`.
    ///
    /// Returns [`CoreError::LockBusy`] without running `rebuild` if another
    /// caller holds the lock. Release failures are logged only; the lock then
    /// lapses after `ttl`.
    pub async fn with_rebuild_lock<T, F>(
        &self,
        owner_key: &str,
        ttl: Duration,
        rebuild: F,
    ) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        let lock_key = keys::lock(owner_key);
        let token = Uuid::new_v4().to_string();

        if !self.cache.set_nx_ex(&lock_key, &token, ttl).await? {
            tracing::debug!(key = %lock_key, "Rebuild lock busy");
            crate::metrics::record_lock_busy();
            return Err(CoreError::LockBusy {
                key: owner_key.to_string(),
            });
        }

        let result = rebuild.await;

        match self.cache.release_lock(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %lock_key, "Rebuild lock expired before release");
            }
            Err(e) => {
                tracing::warn!(key = %lock_key, error = %e, "Failed to release rebuild lock");
            }
        }

        result
    }
}
