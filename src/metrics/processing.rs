//! Harmonizer and metric-deriver metrics

use crate::domain::Diagnostics;
use crate::metrics::{phase_metric, PhaseMetrics};

pub struct HarmonizerMetrics;

impl HarmonizerMetrics {
    pub fn record(diagnostics: &Diagnostics, unmapped_sex: u64, duplicates_merged: u64, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "harmonizer", "runs")).increment(1);
        ::metrics::counter!(phase_metric!(counter, "harmonizer", "unmapped_sex")).increment(unmapped_sex);
        ::metrics::counter!(phase_metric!(counter, "harmonizer", "duplicates_merged")).increment(duplicates_merged);
        ::metrics::gauge!(phase_metric!(gauge, "harmonizer", "geo_unresolved_rows"))
            .set(diagnostics.geo_unresolved_rows() as f64);
        ::metrics::gauge!(phase_metric!(gauge, "harmonizer", "unknown_age_band_rows"))
            .set(diagnostics.unknown_age_band as f64);
        ::metrics::histogram!(phase_metric!(histogram, "harmonizer", "duration_seconds")).record(duration_secs);
    }
}

impl PhaseMetrics for HarmonizerMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "harmonizer", "runs"));
        let _ = ::metrics::counter!(phase_metric!(counter, "harmonizer", "unmapped_sex"));
        let _ = ::metrics::counter!(phase_metric!(counter, "harmonizer", "duplicates_merged"));
        let _ = ::metrics::gauge!(phase_metric!(gauge, "harmonizer", "geo_unresolved_rows"));
        let _ = ::metrics::gauge!(phase_metric!(gauge, "harmonizer", "unknown_age_band_rows"));
        let _ = ::metrics::histogram!(phase_metric!(histogram, "harmonizer", "duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "harmonizer"
    }

    fn metric_names() -> Vec<&'static str> {
        vec![
            phase_metric!(counter, "harmonizer", "runs"),
            phase_metric!(counter, "harmonizer", "unmapped_sex"),
            phase_metric!(counter, "harmonizer", "duplicates_merged"),
            phase_metric!(gauge, "harmonizer", "geo_unresolved_rows"),
            phase_metric!(gauge, "harmonizer", "unknown_age_band_rows"),
            phase_metric!(histogram, "harmonizer", "duration_seconds"),
        ]
    }
}

pub struct DeriverMetrics;

impl DeriverMetrics {
    pub fn record(low_confidence_rows: u64, missing_denominator_rows: u64) {
        ::metrics::gauge!(phase_metric!(gauge, "deriver", "low_confidence_rows")).set(low_confidence_rows as f64);
        ::metrics::gauge!(phase_metric!(gauge, "deriver", "missing_denominator_rows"))
            .set(missing_denominator_rows as f64);
    }
}

impl PhaseMetrics for DeriverMetrics {
    fn register_metrics() {
        let _ = ::metrics::gauge!(phase_metric!(gauge, "deriver", "low_confidence_rows"));
        let _ = ::metrics::gauge!(phase_metric!(gauge, "deriver", "missing_denominator_rows"));
    }

    fn phase_name() -> &'static str {
        "deriver"
    }

    fn metric_names() -> Vec<&'static str> {
        vec![
            phase_metric!(gauge, "deriver", "low_confidence_rows"),
            phase_metric!(gauge, "deriver", "missing_denominator_rows"),
        ]
    }
}
