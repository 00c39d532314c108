//! Query cache metrics

use crate::metrics::{phase_metric, PhaseMetrics};

pub struct CacheMetrics;

impl CacheMetrics {
    pub fn record_hit(function: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "cache", "hits"), "function" => function).increment(1);
    }

    pub fn record_miss(function: &'static str, compute_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "cache", "misses"), "function" => function).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "cache", "compute_seconds"), "function" => function)
            .record(compute_secs);
    }

    pub fn record_invalidation(entries: usize) {
        ::metrics::counter!(phase_metric!(counter, "cache", "invalidations")).increment(1);
        ::metrics::gauge!(phase_metric!(gauge, "cache", "entries")).set(0.0);
        ::metrics::counter!(phase_metric!(counter, "cache", "evicted_entries")).increment(entries as u64);
    }

    pub fn record_size(entries: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "cache", "entries")).set(entries as f64);
    }
}

impl PhaseMetrics for CacheMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "cache", "invalidations"));
        let _ = ::metrics::counter!(phase_metric!(counter, "cache", "evicted_entries"));
        let _ = ::metrics::gauge!(phase_metric!(gauge, "cache", "entries"));
    }

    fn phase_name() -> &'static str {
        "cache"
    }

    fn metric_names() -> Vec<&'static str> {
        vec![
            phase_metric!(counter, "cache", "hits"),
            phase_metric!(counter, "cache", "misses"),
            phase_metric!(histogram, "cache", "compute_seconds"),
            phase_metric!(counter, "cache", "invalidations"),
            phase_metric!(counter, "cache", "evicted_entries"),
            phase_metric!(gauge, "cache", "entries"),
        ]
    }
}
