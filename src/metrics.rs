//! Process-local request counters.
//!
//! Counters are plain [`AtomicU64`]s incremented with relaxed ordering; the
//! gateway never reads them on the request path. [`Metrics::snapshot`]
//! produces a serializable copy for the admin surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Fire-and-forget counters shared by every pipeline stage.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limit_blocks: AtomicU64,
    blocked_ips: AtomicU64,
    corrupt_entries: AtomicU64,
    upstream_errors: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rate_limit_blocks: u64,
    pub blocked_ips: u64,
    pub corrupt_entries: u64,
    pub upstream_errors: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_block(&self) {
        self.rate_limit_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked_ip(&self) {
        self.blocked_ips.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a cache entry that was deleted because it could not be decoded
    /// or failed validation.
    pub fn record_corrupt_entry(&self) {
        self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            rate_limit_blocks: self.rate_limit_blocks.load(Ordering::Relaxed),
            blocked_ips: self.blocked_ips.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metrics_start_at_zero() {
        assert_eq!(Metrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = Metrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_rate_limit_block();
        metrics.record_blocked_ip();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.rate_limit_blocks, 1);
        assert_eq!(snap.blocked_ips, 1);
        assert_eq!(snap.corrupt_entries, 0);
    }
}
