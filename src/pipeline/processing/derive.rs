use tracing::{info, instrument};

use crate::constants::{DEFAULT_SMALL_COUNT_THRESHOLD, RATE_SCALE};
use crate::domain::ObservationTable;
use crate::error::Result;
use crate::metrics::DeriverMetrics;

/// Patients per 10,000 inhabitants; `None` when the denominator is missing or zero
pub fn prevalence_rate(patient_count: u64, population: Option<u64>) -> Option<f64> {
    population
        .filter(|p| *p > 0)
        .map(|p| patient_count as f64 * RATE_SCALE / p as f64)
}

/// Trait for computing per-row derived metrics
pub trait MetricDeriver {
    fn derive(&self, table: ObservationTable) -> Result<ObservationTable>;
}

/// Configuration for derived metrics
#[derive(Debug, Clone)]
pub struct DeriveConfig {
    /// Counts strictly below this are flagged low-confidence
    pub small_count_threshold: u64,
}

impl Default for DeriveConfig {
    fn default() -> Self {
        Self {
            small_count_threshold: DEFAULT_SMALL_COUNT_THRESHOLD,
        }
    }
}

/// Computes prevalence rates and disclosure-control flags
#[derive(Debug, Clone, Default)]
pub struct DefaultMetricDeriver {
    pub config: DeriveConfig,
}

impl DefaultMetricDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DeriveConfig) -> Self {
        Self { config }
    }
}

impl MetricDeriver for DefaultMetricDeriver {
    #[instrument(skip(self, table), fields(rows = table.len()))]
    fn derive(&self, mut table: ObservationTable) -> Result<ObservationTable> {
        let threshold = self.config.small_count_threshold;
        let mut low_confidence = 0u64;
        let mut missing_denominator = 0u64;

        for row in table.rows.iter_mut() {
            row.prevalence_rate = prevalence_rate(row.patient_count, row.population);
            row.low_confidence = row.patient_count < threshold;
            if row.prevalence_rate.is_none() {
                missing_denominator += 1;
            }
            if row.low_confidence {
                low_confidence += 1;
            }
        }

        table.diagnostics.low_confidence_rows = low_confidence;
        table.diagnostics.missing_denominator_rows = missing_denominator;
        info!(
            "Derived rates for {} rows ({} low-confidence, {} without denominator)",
            table.len(),
            low_confidence,
            missing_denominator
        );
        DeriverMetrics::record(low_confidence, missing_denominator);
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Coded, Observation, PathologyLevel, Sex};

    fn row(count: u64, population: Option<u64>) -> Observation {
        Observation {
            region_code: "11".to_string(),
            department_code: "75".to_string(),
            sex: Coded::Canonical(Sex::Both),
            age_band: Coded::Raw("00-04".to_string()),
            year: 2022,
            pathology_code: "DIAB".to_string(),
            pathology_level: PathologyLevel::Top,
            pathology_path: vec!["Diabète".to_string()],
            patient_count: count,
            population,
            geo_resolved: true,
            prevalence_rate: None,
            low_confidence: false,
        }
    }

    #[test]
    fn test_prevalence_rate_per_ten_thousand() {
        assert_eq!(prevalence_rate(50, Some(20_000)), Some(25.0));
        assert_eq!(prevalence_rate(50, Some(0)), None);
        assert_eq!(prevalence_rate(50, None), None);
    }

    #[test]
    fn test_derive_flags_small_counts_and_missing_denominators() {
        let table = ObservationTable {
            rows: vec![row(10, Some(1000)), row(11, None), row(0, Some(5))],
            ..ObservationTable::default()
        };
        let out = DefaultMetricDeriver::new().derive(table).unwrap();
        assert!(out.rows[0].low_confidence);
        assert!(!out.rows[1].low_confidence);
        assert!(out.rows[2].low_confidence);
        assert_eq!(out.rows[0].prevalence_rate, Some(100.0));
        assert_eq!(out.rows[1].prevalence_rate, None);
        assert_eq!(out.diagnostics.low_confidence_rows, 2);
        assert_eq!(out.diagnostics.missing_denominator_rows, 1);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let deriver = DefaultMetricDeriver::with_config(DeriveConfig {
            small_count_threshold: 5,
        });
        let table = ObservationTable {
            rows: vec![row(10, Some(1000))],
            ..ObservationTable::default()
        };
        let out = deriver.derive(table).unwrap();
        assert!(!out.rows[0].low_confidence);
    }

    #[test]
    fn test_derive_is_idempotent() {
        let table = ObservationTable {
            rows: vec![row(10, Some(3000)), row(40, None)],
            ..ObservationTable::default()
        };
        let deriver = DefaultMetricDeriver::new();
        let once = deriver.derive(table).unwrap();
        let twice = deriver.derive(once.clone()).unwrap();
        assert_eq!(once, twice);
    }
}
