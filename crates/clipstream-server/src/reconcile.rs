//! Periodic counter reconciliation between cached video records and the
//! durable store.
//!
//! A cached record whose counters are behind the store is dropped so the next
//! read reloads it. A record ahead of the store points at write-back lag or a
//! dropped message: it is reported, and with `repair_store` the durable
//! counters are recounted from the like and comment rows. The cached value is
//! never written to the store, since a write-back still in flight would then
//! be counted twice.

use std::time::Duration;

use clipstream_storage::{CounterColumn, DynDurableStore, Video, with_transaction};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{CacheBackend, CacheRecord, Decoded, keys};
use crate::error::CoreError;

const COUNTERS: [CounterColumn; 2] = [CounterColumn::LikeCount, CounterColumn::CommentCount];

/// Outcome of one sweep, by video id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub checked: usize,
    pub invalidated: Vec<i64>,
    pub ahead: Vec<i64>,
    pub repaired: Vec<i64>,
}

#[derive(Clone)]
pub struct Reconciler {
    cache: CacheBackend,
    store: DynDurableStore,
    repair_store: bool,
}

impl Reconciler {
    pub fn new(cache: CacheBackend, store: DynDurableStore) -> Self {
        Self {
            cache,
            store,
            repair_store: false,
        }
    }

    #[must_use]
    pub fn with_repair_store(mut self, repair_store: bool) -> Self {
        self.repair_store = repair_store;
        self
    }

    /// Compares every cached video record against its durable row.
    pub async fn sweep(&self) -> Result<ReconcileResult, CoreError> {
        let videos = self.store.list_videos().await?;
        let mut result = ReconcileResult::default();

        for durable in videos {
            result.checked += 1;
            let key = keys::video(durable.id);
            let fields = match self.cache.hgetall(&key).await {
                Ok(fields) => fields,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Reconcile read failed, skipped");
                    continue;
                }
            };
            let Decoded::Present(cached) = Video::decode(&fields) else {
                continue;
            };

            if COUNTERS
                .iter()
                .any(|c| cached.counter(*c) < durable.counter(*c))
            {
                match self.cache.del(&key).await {
                    Ok(_) => {
                        tracing::info!(video_id = durable.id, "Cached counters behind store, invalidated");
                        crate::metrics::record_reconcile_invalidated();
                        result.invalidated.push(durable.id);
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Failed to invalidate stale record");
                    }
                }
                continue;
            }

            let drift: Vec<(CounterColumn, i64)> = COUNTERS
                .iter()
                .map(|c| (*c, cached.counter(*c) - durable.counter(*c)))
                .filter(|(_, diff)| *diff > 0)
                .collect();
            if drift.is_empty() {
                continue;
            }

            tracing::warn!(
                video_id = durable.id,
                drift = ?drift,
                "Cached counters ahead of store"
            );
            crate::metrics::record_reconcile_ahead();
            result.ahead.push(durable.id);

            if self.repair_store && self.repair(durable.id).await {
                result.repaired.push(durable.id);
            }
        }

        tracing::info!(
            checked = result.checked,
            invalidated = result.invalidated.len(),
            ahead = result.ahead.len(),
            repaired = result.repaired.len(),
            "Reconcile sweep finished"
        );
        Ok(result)
    }

    async fn repair(&self, video_id: i64) -> bool {
        let recounted = with_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.recount_counters(video_id).await })
        })
        .await;
        match recounted {
            Ok(video) => {
                tracing::info!(
                    video_id,
                    like_count = video.like_count,
                    comment_count = video.comment_count,
                    "Store counters recounted from rows"
                );
                true
            }
            Err(e) => {
                tracing::warn!(video_id, error = %e, "Failed to recount store counters");
                false
            }
        }
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the task is aborted.
    /// The first sweep starts after one full interval.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!(error = %e, "Reconcile sweep failed");
                }
            }
        })
    }
}
