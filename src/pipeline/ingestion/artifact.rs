use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, instrument};

use crate::domain::ObservationTable;
use crate::error::{PipelineError, Result};
use crate::metrics::LoaderMetrics;

/// Version of the pre-cleaned artifact layout
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Serialized form of a harmonized table, read instead of the raw CSV
#[derive(Debug, Serialize, Deserialize)]
pub struct CleanArtifact {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub table: ObservationTable,
}

/// Write the table as a pre-cleaned artifact, creating parent directories as needed
#[instrument(skip(table), fields(rows = table.len()))]
pub fn write_artifact<P: AsRef<Path> + std::fmt::Debug>(table: &ObservationTable, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let artifact = CleanArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        created_at: Utc::now(),
        table: table.clone(),
    };
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &artifact)?;
    writer.flush()?;
    info!("Wrote clean artifact to {}", path.display());
    Ok(())
}

/// Read a pre-cleaned artifact back into a table
#[instrument]
pub fn read_artifact<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<ObservationTable> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let artifact: CleanArtifact = serde_json::from_reader(reader)?;
    if artifact.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(PipelineError::Config(format!(
            "clean artifact {} has format version {}, expected {}",
            path.as_ref().display(),
            artifact.format_version,
            ARTIFACT_FORMAT_VERSION
        )));
    }
    info!("Read clean artifact with {} rows", artifact.table.len());
    LoaderMetrics::record_artifact_read(artifact.table.len());
    Ok(artifact.table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Diagnostics, LoadReport};

    #[test]
    fn test_artifact_keeps_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clean.json");
        let table = ObservationTable {
            diagnostics: Diagnostics {
                load: LoadReport {
                    source_name: "effectifs.csv".to_string(),
                    delimiter: ';',
                    rows_read: 12,
                    rows_loaded: 10,
                    ..LoadReport::default()
                },
                unmapped_sex: 2,
                ..Diagnostics::default()
            },
            ..ObservationTable::default()
        };
        write_artifact(&table, &path).unwrap();
        assert_eq!(read_artifact(&path).unwrap(), table);
    }

    #[test]
    fn test_unknown_format_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.json");
        let body = serde_json::json!({
            "format_version": ARTIFACT_FORMAT_VERSION + 1,
            "created_at": Utc::now(),
            "table": ObservationTable::default(),
        });
        std::fs::write(&path, body.to_string()).unwrap();
        let err = read_artifact(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("format version"));
    }
}
