//! Raw loader metrics

use crate::domain::LoadReport;
use crate::metrics::{phase_metric, PhaseMetrics};

pub struct LoaderMetrics;

impl LoaderMetrics {
    /// Record the outcome of one raw load
    pub fn record_load(report: &LoadReport, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "loader", "loads")).increment(1);
        ::metrics::counter!(phase_metric!(counter, "loader", "rows_read")).increment(report.rows_read);
        ::metrics::counter!(phase_metric!(counter, "loader", "rows_loaded")).increment(report.rows_loaded);
        for (reason, count) in &report.excluded {
            ::metrics::counter!(
                phase_metric!(counter, "loader", "rows_excluded"),
                "reason" => reason.to_string()
            )
            .increment(*count);
        }
        ::metrics::counter!(phase_metric!(counter, "loader", "zero_population"))
            .increment(report.zero_population);
        ::metrics::histogram!(phase_metric!(histogram, "loader", "duration_seconds")).record(duration_secs);
    }

    pub fn record_artifact_read(rows: usize) {
        ::metrics::counter!(phase_metric!(counter, "loader", "artifact_reads")).increment(1);
        ::metrics::gauge!(phase_metric!(gauge, "loader", "artifact_rows")).set(rows as f64);
    }
}

impl PhaseMetrics for LoaderMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "loader", "loads"));
        let _ = ::metrics::counter!(phase_metric!(counter, "loader", "rows_read"));
        let _ = ::metrics::counter!(phase_metric!(counter, "loader", "rows_loaded"));
        let _ = ::metrics::counter!(phase_metric!(counter, "loader", "zero_population"));
        let _ = ::metrics::counter!(phase_metric!(counter, "loader", "artifact_reads"));
        let _ = ::metrics::histogram!(phase_metric!(histogram, "loader", "duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "loader"
    }

    fn metric_names() -> Vec<&'static str> {
        vec![
            phase_metric!(counter, "loader", "loads"),
            phase_metric!(counter, "loader", "rows_read"),
            phase_metric!(counter, "loader", "rows_loaded"),
            phase_metric!(counter, "loader", "rows_excluded"),
            phase_metric!(counter, "loader", "zero_population"),
            phase_metric!(counter, "loader", "artifact_reads"),
            phase_metric!(gauge, "loader", "artifact_rows"),
            phase_metric!(histogram, "loader", "duration_seconds"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExclusionReason;

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        let mut report = LoadReport::default();
        report.exclude(ExclusionReason::BadYear);
        LoaderMetrics::record_load(&report, 0.01);
        LoaderMetrics::register_metrics();
    }

    #[test]
    fn test_metric_names_follow_convention() {
        for name in LoaderMetrics::metric_names() {
            assert!(name.starts_with("atlas_loader_"));
        }
    }
}
