use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Identity of a source file as seen on disk; a change means cached results are stale
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceSignature {
    /// Canonical path when resolvable, otherwise as given
    pub path: String,
    /// File size in bytes
    pub len: u64,
    /// Last modification time, when the platform reports one
    pub modified: Option<DateTime<Utc>>,
}

impl SourceSignature {
    /// Read the signature of `path` from file metadata
    pub fn of<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(Self {
            path: resolved.display().to_string(),
            len: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Stable textual form used inside cache keys
    pub fn fingerprint(&self) -> String {
        let modified = self
            .modified
            .map(|m| m.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_default();
        format!("{}|{}|{}", self.path, self.len, modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_signature_changes_with_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "annee;top\n").unwrap();
        file.flush().unwrap();
        let before = SourceSignature::of(file.path()).unwrap();

        write!(file, "2022;DIAB\n").unwrap();
        file.flush().unwrap();
        let after = SourceSignature::of(file.path()).unwrap();

        assert_eq!(before.path, after.path);
        assert_ne!(before.len, after.len);
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SourceSignature::of("/definitely/not/here.csv").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
