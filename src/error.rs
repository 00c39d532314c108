use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Schema error: required column `{column}` is missing from {source_name}")]
    MissingColumn { column: String, source_name: String },

    #[error("Schema error: {source_name} has no header row")]
    EmptySource { source_name: String },

    #[error("Consistency error: duplicate rows for key {key} disagree on patient count ({first} vs {second})")]
    Consistency { key: String, first: u64, second: u64 },

    #[error("Consistency error: taxonomy entry `{code}` maps to both `{existing}` and `{incoming}`")]
    TaxonomyConflict {
        code: String,
        existing: String,
        incoming: String,
    },

    #[error("Consistency error: pathology `{code}` {reason}")]
    InvalidTaxonomy { code: String, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse error families, used by callers to pick how to surface a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Consistency,
    Io,
    Config,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MissingColumn { .. } | PipelineError::EmptySource { .. } => ErrorKind::Schema,
            PipelineError::Consistency { .. }
            | PipelineError::TaxonomyConflict { .. }
            | PipelineError::InvalidTaxonomy { .. } => ErrorKind::Consistency,
            PipelineError::Csv(_) | PipelineError::Json(_) | PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Toml(_) | PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Schema and consistency failures halt the pipeline and must be shown as blocking
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Schema | ErrorKind::Consistency)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_column_names_the_column() {
        let err = PipelineError::MissingColumn {
            column: "npop".to_string(),
            source_name: "effectifs.csv".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("`npop`"));
    }

    #[test]
    fn test_io_errors_are_not_fatal_kind() {
        let err = PipelineError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!err.is_fatal());
    }
}
