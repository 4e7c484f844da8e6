//! In-process metrics (C10): per-backend counters via `metered`, plus a
//! process-wide dispatch registry. Prometheus text exposition is an
//! external collaborator; these registries are just queryable counters,
//! mirroring the teacher's `#[metered(...)]` use on `OpenRequestHandle`.

use metered::{metered, HitCount, ResponseTime, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};

/// Attached to each [`crate::rpcs::backend::Backend`]. The `metrics` field
/// holds the registry `#[metered]` generates below, the way the teacher's
/// `OpenRequestHandle` holds an `Arc<OpenRequestHandleMetrics>`.
#[derive(Default, Debug)]
pub struct BackendMeter {
    pub retries_total: AtomicU64,
    metrics: BackendMetrics,
}

#[metered(registry = BackendMetrics, visibility = pub)]
impl BackendMeter {
    #[measure([HitCount, ResponseTime, Throughput])]
    pub fn noop_probe(&self) {}

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide counters the dispatcher bumps on every call. Plain atomics
/// rather than `metered` registries since these aren't wrapping a single
/// instrumented method — they're tallied from several call sites.
#[derive(Default, Debug)]
pub struct DispatchMetrics {
    pub requests_total: AtomicU64,
    pub cache_hits_total: AtomicU64,
    pub cache_misses_total: AtomicU64,
    pub rate_limit_rejections_total: AtomicU64,
    pub consensus_poll_ticks_total: AtomicU64,
    pub backend_bans_total: AtomicU64,
}

impl DispatchMetrics {
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_rejection(&self) {
        self.rate_limit_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consensus_tick(&self) {
        self.consensus_poll_ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_ban(&self) {
        self.backend_bans_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_metrics_start_at_zero_and_increment() {
        let metrics = DispatchMetrics::default();
        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 0);
        metrics.record_request();
        metrics.record_cache_hit();
        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cache_hits_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn backend_meter_tracks_retries() {
        let meter = BackendMeter::default();
        meter.record_retry();
        assert_eq!(meter.retries_total.load(Ordering::Relaxed), 1);
    }
}
