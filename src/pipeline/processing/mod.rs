// Pipeline processing: harmonization, derived metrics and quality reporting

pub mod derive;
pub mod harmonize;
pub mod quality_report;

pub use derive::{prevalence_rate, DefaultMetricDeriver, DeriveConfig, MetricDeriver};
pub use harmonize::{DefaultHarmonizer, GeoReference, Harmonizer};
pub use quality_report::{DataQualityReport, PopulationConflict, PopulationUnion};
