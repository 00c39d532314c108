// Data processing pipeline: ingestion, processing, and aggregation

pub mod aggregate;
pub mod ingestion;
pub mod processing;
