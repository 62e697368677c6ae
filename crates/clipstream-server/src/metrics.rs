//! Prometheus metrics for the clipstream cache layer.
//!
//! This module provides:
//! - Cache metrics (hits, misses, negative hits, operation timeouts)
//! - Rebuild metrics (owner-set rebuilds, lock contention)
//! - Script outcome counts
//! - Write-back pipeline and reconciliation counters

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_NEGATIVE_HITS_TOTAL: &str = "cache_negative_hits_total";
    pub const CACHE_TIMEOUTS_TOTAL: &str = "cache_timeouts_total";

    // Rebuild metrics
    pub const SET_REBUILDS_TOTAL: &str = "set_rebuilds_total";
    pub const REBUILD_LOCK_BUSY_TOTAL: &str = "rebuild_lock_busy_total";

    // Script metrics
    pub const SCRIPT_OUTCOMES_TOTAL: &str = "script_outcomes_total";

    // Write-back metrics
    pub const WRITEBACK_APPLIED_TOTAL: &str = "writeback_applied_total";
    pub const WRITEBACK_DROPPED_TOTAL: &str = "writeback_dropped_total";

    // Reconciliation metrics
    pub const RECONCILE_INVALIDATED_TOTAL: &str = "reconcile_invalidated_total";
    pub const RECONCILE_AHEAD_TOTAL: &str = "reconcile_ahead_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// With `listen` set, an HTTP scrape endpoint is started on that address
/// (must be called inside the Tokio runtime). Otherwise a pull recorder is
/// installed and [`render_metrics`] returns the text exposition.
///
/// Returns `true` if initialization succeeded, `false` if already initialized
/// or the recorder could not be installed.
pub fn init_metrics(listen: Option<SocketAddr>) -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    if let Some(addr) = listen {
        return match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => {
                tracing::info!(addr = %addr, "Prometheus exporter listening");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Prometheus exporter");
                false
            }
        };
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if the pull recorder was not installed.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit for an entity kind.
pub fn record_cache_hit(kind: &str) {
    counter!(names::CACHE_HITS_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record a cache miss for an entity kind.
pub fn record_cache_miss(kind: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record a hit on a negative-cache entry.
pub fn record_negative_hit(kind: &str) {
    counter!(names::CACHE_NEGATIVE_HITS_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_cache_timeout(op: &'static str) {
    counter!(names::CACHE_TIMEOUTS_TOTAL, "op" => op).increment(1);
}

// =============================================================================
// Rebuild Metrics
// =============================================================================

pub fn record_set_rebuild(relation: &'static str) {
    counter!(names::SET_REBUILDS_TOTAL, "relation" => relation).increment(1);
}

pub fn record_lock_busy() {
    counter!(names::REBUILD_LOCK_BUSY_TOTAL).increment(1);
}

// =============================================================================
// Script Metrics
// =============================================================================

pub fn record_script_outcome(script: &'static str, outcome: &'static str) {
    counter!(
        names::SCRIPT_OUTCOMES_TOTAL,
        "script" => script,
        "outcome" => outcome
    )
    .increment(1);
}

// =============================================================================
// Write-back and Reconciliation Metrics
// =============================================================================

pub fn record_writeback_applied(channel: &'static str) {
    counter!(names::WRITEBACK_APPLIED_TOTAL, "channel" => channel).increment(1);
}

pub fn record_writeback_dropped(channel: &'static str, reason: &'static str) {
    counter!(
        names::WRITEBACK_DROPPED_TOTAL,
        "channel" => channel,
        "reason" => reason
    )
    .increment(1);
}

pub fn record_reconcile_invalidated() {
    counter!(names::RECONCILE_INVALIDATED_TOTAL).increment(1);
}

pub fn record_reconcile_ahead() {
    counter!(names::RECONCILE_AHEAD_TOTAL).increment(1);
}
