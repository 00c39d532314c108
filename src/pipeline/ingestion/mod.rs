// Pipeline ingestion: raw CSV loading, pre-cleaned artifacts, and source signatures

pub mod artifact;
pub mod loader;
pub mod signature;

pub use artifact::{read_artifact, write_artifact};
pub use loader::{load, load_reader, sniff_delimiter};
pub use signature::SourceSignature;
