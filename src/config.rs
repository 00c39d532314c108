use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::DEFAULT_SMALL_COUNT_THRESHOLD;
use crate::error::{PipelineError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "atlas.toml";

pub const ENV_CONFIG: &str = "ATLAS_CONFIG";
pub const ENV_SOURCE: &str = "ATLAS_SOURCE";
pub const ENV_USE_CLEANED: &str = "ATLAS_USE_CLEANED";
pub const ENV_SMALL_COUNT_THRESHOLD: &str = "ATLAS_SMALL_COUNT_THRESHOLD";
pub const ENV_METRICS_ADDR: &str = "ATLAS_METRICS_ADDR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data: DataConfig,
    pub geo: GeoConfig,
    pub derive: DeriveSettings,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Raw CSV as published
    pub source: PathBuf,
    /// Pre-cleaned artifact written by `clean`
    pub cleaned_artifact: PathBuf,
    /// Read the artifact instead of the raw CSV
    pub use_cleaned: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("data/effectifs.csv"),
            cleaned_artifact: PathBuf::from("data/effectifs.clean.json"),
            use_cleaned: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Department to region reference CSV
    pub reference: Option<PathBuf>,
    pub departments_geojson: Option<PathBuf>,
    pub regions_geojson: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeriveSettings {
    pub small_count_threshold: u64,
}

impl Default for DeriveSettings {
    fn default() -> Self {
        Self {
            small_count_threshold: DEFAULT_SMALL_COUNT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "prevalence_atlas.log".to_string(),
            filter: "prevalence_atlas=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listen address; no exporter when unset
    pub addr: Option<String>,
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(PipelineError::Config(format!("{} must be a boolean, got '{}'", name, other))),
    }
}

impl Settings {
    /// Load from `ATLAS_CONFIG` (or `atlas.toml`), then apply environment overrides.
    ///
    /// A missing default file yields defaults; a missing file named by
    /// `ATLAS_CONFIG` is an error.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(ENV_CONFIG).ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = if explicit.is_some() || Path::new(&path).exists() {
            Self::from_path(&path)?
        } else {
            debug!("No {} found, using defaults", path);
            Self::default()
        };
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `ATLAS_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(source) = lookup(ENV_SOURCE) {
            self.data.source = PathBuf::from(source);
        }
        if let Some(flag) = lookup(ENV_USE_CLEANED) {
            self.data.use_cleaned = parse_bool(ENV_USE_CLEANED, &flag)?;
        }
        if let Some(threshold) = lookup(ENV_SMALL_COUNT_THRESHOLD) {
            self.derive.small_count_threshold = threshold.trim().parse().map_err(|_| {
                PipelineError::Config(format!("{} must be a non-negative integer, got '{}'", ENV_SMALL_COUNT_THRESHOLD, threshold))
            })?;
        }
        if let Some(addr) = lookup(ENV_METRICS_ADDR) {
            self.metrics.addr = (!addr.trim().is_empty()).then(|| addr.trim().to_string());
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.source.as_os_str().is_empty() {
            return Err(PipelineError::Config("data.source must not be empty".to_string()));
        }
        if self.data.use_cleaned && self.data.cleaned_artifact.as_os_str().is_empty() {
            return Err(PipelineError::Config(
                "data.use_cleaned is set but data.cleaned_artifact is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_document_gives_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.derive.small_count_threshold, 11);
        assert!(!settings.data.use_cleaned);
    }

    #[test]
    fn test_partial_document() {
        let settings = Settings::from_toml_str(
            r#"
            [data]
            source = "raw/prevalence.csv"
            use_cleaned = true

            [geo]
            reference = "ref/departements.csv"

            [metrics]
            addr = "127.0.0.1:9898"
            "#,
        )
        .unwrap();
        assert_eq!(settings.data.source, PathBuf::from("raw/prevalence.csv"));
        assert!(settings.data.use_cleaned);
        assert_eq!(settings.data.cleaned_artifact, DataConfig::default().cleaned_artifact);
        assert_eq!(settings.geo.reference, Some(PathBuf::from("ref/departements.csv")));
        assert_eq!(settings.metrics.addr.as_deref(), Some("127.0.0.1:9898"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SOURCE, "other.csv"),
            (ENV_USE_CLEANED, "yes"),
            (ENV_SMALL_COUNT_THRESHOLD, "5"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.data.source, PathBuf::from("other.csv"));
        assert!(settings.data.use_cleaned);
        assert_eq!(settings.derive.small_count_threshold, 5);
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|name| (name == ENV_USE_CLEANED).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_malformed_toml_is_reported() {
        let err = Settings::from_toml_str("[data\nsource = 1").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
