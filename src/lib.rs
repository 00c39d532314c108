pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod query;

// Domain data shapes shared across stages
pub mod domain;

pub use cache::{CacheKey, PipelineCache};
pub use error::{ErrorKind, PipelineError, Result};
pub use pipeline::aggregate::{FilterSpec, GeoLevel};
pub use query::{AtlasPipeline, DataSource};
