use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{IndexError, Outcome};

const LATENCY_BUCKET_COUNT: usize = 10;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Event processing counters.
#[derive(Default)]
pub struct IndexerMetrics {
    applied: AtomicU64,
    reverted: AtomicU64,
    nothing_to_revert: AtomicU64,
    partial: AtomicU64,
    decode_errors: AtomicU64,
    validation_errors: AtomicU64,
    store_errors: AtomicU64,
    revert_unsupported: AtomicU64,
    allowance_rejections: AtomicU64,
    reconciled: AtomicU64,
    pending_reconcile: AtomicU64,
    latency: LatencyMetrics,
}

#[derive(Clone, Debug, Serialize)]
pub struct IndexerMetricsSnapshot {
    pub applied: u64,
    pub reverted: u64,
    pub nothing_to_revert: u64,
    pub partial: u64,
    pub decode_errors: u64,
    pub validation_errors: u64,
    pub store_errors: u64,
    pub revert_unsupported: u64,
    pub allowance_rejections: u64,
    pub reconciled: u64,
    pub pending_reconcile: u64,
    pub latency: LatencySnapshot,
}

impl IndexerMetrics {
    pub fn record(&self, result: &Result<Outcome, IndexError>, duration: Duration) {
        self.latency.record(duration);
        let counter = match result {
            Ok(Outcome::Applied) => &self.applied,
            Ok(Outcome::Reverted) => &self.reverted,
            Ok(Outcome::NothingToRevert) => &self.nothing_to_revert,
            Ok(Outcome::Partial { .. }) => &self.partial,
            Err(IndexError::Decode(_)) => &self.decode_errors,
            Err(IndexError::Validation(_)) => &self.validation_errors,
            Err(IndexError::StoreUnavailable { .. }) => &self.store_errors,
            Err(IndexError::RevertUnsupported { .. }) => &self.revert_unsupported,
            Err(IndexError::InsufficientAllowance { .. }) => &self.allowance_rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_reconciled(&self, count: u64) {
        self.reconciled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_pending_reconcile(&self, count: u64) {
        self.pending_reconcile.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IndexerMetricsSnapshot {
        IndexerMetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            reverted: self.reverted.load(Ordering::Relaxed),
            nothing_to_revert: self.nothing_to_revert.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            revert_unsupported: self.revert_unsupported.load(Ordering::Relaxed),
            allowance_rejections: self.allowance_rejections.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            pending_reconcile: self.pending_reconcile.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Notification delivery counters (websocket viewers and Redis fan-out).
#[derive(Default)]
pub struct NotifyMetrics {
    ws_connections: AtomicU64,
    ws_lagged: AtomicU64,
    ws_send_errors: AtomicU64,
    ws_origin_rejected: AtomicU64,
    fanout_published: AtomicU64,
    fanout_received: AtomicU64,
    fanout_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct NotifyMetricsSnapshot {
    pub ws_connections: u64,
    pub ws_lagged: u64,
    pub ws_send_errors: u64,
    pub ws_origin_rejected: u64,
    pub fanout_published: u64,
    pub fanout_received: u64,
    pub fanout_errors: u64,
}

impl NotifyMetrics {
    pub fn inc_ws_connections(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_ws_connections(&self) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                value.checked_sub(1)
            });
    }

    pub fn add_ws_lagged(&self, skipped: u64) {
        self.ws_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn inc_ws_send_error(&self) {
        self.ws_send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ws_origin_rejected(&self) {
        self.ws_origin_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout_published(&self) {
        self.fanout_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout_received(&self) {
        self.fanout_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout_error(&self) {
        self.fanout_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NotifyMetricsSnapshot {
        NotifyMetricsSnapshot {
            ws_connections: self.ws_connections.load(Ordering::Relaxed),
            ws_lagged: self.ws_lagged.load(Ordering::Relaxed),
            ws_send_errors: self.ws_send_errors.load(Ordering::Relaxed),
            ws_origin_rejected: self.ws_origin_rejected.load(Ordering::Relaxed),
            fanout_published: self.fanout_published.load(Ordering::Relaxed),
            fanout_received: self.fanout_received.load(Ordering::Relaxed),
            fanout_errors: self.fanout_errors.load(Ordering::Relaxed),
        }
    }
}
