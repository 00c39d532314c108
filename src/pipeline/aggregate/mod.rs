//! Filtered views over the prepared table: maps, treemaps, correlations and summaries

pub mod correlation;
pub mod filter;
pub mod geo;
pub mod hierarchy;
pub mod summary;

pub use correlation::{correlation_matrix, top_categories, CategoryTotal, CorrelationMatrix, CorrelationPair};
pub use filter::FilterSpec;
pub use geo::{geo_aggregate, GeoAggregate, GeoAggregateRow, GeoLevel};
pub use hierarchy::{hierarchy_aggregate, PathologyTree, TreemapColumns, TreemapNode};
pub use summary::{
    distinct_pathologies, prevalence_timeseries, summarize, total_patients, year_range, Summary, TimeseriesPoint,
};
