//! Query interface handed to presentation code.
//!
//! Every method is a pure function of (dataset snapshot, filter) memoized in
//! the caller-provided [`PipelineCache`].

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::cache::{CacheKey, PipelineCache};
use crate::config::Settings;
use crate::constants::{
    FN_CORRELATION_MATRIX, FN_GEO_AGGREGATE, FN_HIERARCHY_AGGREGATE, FN_PREPARE, FN_QUALITY_REPORT, FN_SUMMARY,
    FN_TIMESERIES, FN_TOP_CATEGORIES,
};
use crate::domain::ObservationTable;
use crate::error::Result;
use crate::pipeline::aggregate::{
    self, CategoryTotal, CorrelationMatrix, FilterSpec, GeoAggregate, GeoLevel, PathologyTree, Summary,
    TimeseriesPoint,
};
use crate::pipeline::ingestion::{self, SourceSignature};
use crate::pipeline::processing::harmonize::BoundaryLayer;
use crate::pipeline::processing::{
    DataQualityReport, DefaultHarmonizer, DefaultMetricDeriver, DeriveConfig, GeoReference, Harmonizer, MetricDeriver,
};

/// Where the prepared table comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum DataSource {
    /// Raw CSV as published
    Raw(PathBuf),
    /// Artifact previously written by `write_clean_artifact`
    Cleaned(PathBuf),
}

impl DataSource {
    pub fn path(&self) -> &Path {
        match self {
            DataSource::Raw(p) | DataSource::Cleaned(p) => p,
        }
    }
}

/// The prevalence pipeline bound to one data source and geographic reference
pub struct AtlasPipeline {
    source: DataSource,
    geo: Arc<GeoReference>,
    geo_digest: String,
    harmonizer: DefaultHarmonizer,
    deriver: DefaultMetricDeriver,
    loads: AtomicUsize,
}

impl AtlasPipeline {
    pub fn new(source: DataSource, geo: Arc<GeoReference>, derive: DeriveConfig) -> Result<Self> {
        Ok(Self {
            geo_digest: geo.digest()?,
            harmonizer: DefaultHarmonizer::new(geo.clone())?,
            deriver: DefaultMetricDeriver::with_config(derive),
            source,
            geo,
            loads: AtomicUsize::new(0),
        })
    }

    /// Build the source, geographic reference and deriver from settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let source = if settings.data.use_cleaned {
            DataSource::Cleaned(settings.data.cleaned_artifact.clone())
        } else {
            DataSource::Raw(settings.data.source.clone())
        };

        let mut geo = match &settings.geo.reference {
            Some(path) => GeoReference::from_csv_path(path)?,
            None => {
                warn!("No geographic reference configured; every department will be unresolved");
                GeoReference::new()
            }
        };
        if let Some(path) = &settings.geo.departments_geojson {
            geo = geo.with_department_boundaries(BoundaryLayer::from_path(path)?);
        }
        if let Some(path) = &settings.geo.regions_geojson {
            geo = geo.with_region_boundaries(BoundaryLayer::from_path(path)?);
        }

        Self::new(
            source,
            Arc::new(geo),
            DeriveConfig {
                small_count_threshold: settings.derive.small_count_threshold,
            },
        )
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn geo(&self) -> &GeoReference {
        &self.geo
    }

    /// How many times the source has actually been read
    pub fn loader_invocations(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn signature(&self) -> Result<SourceSignature> {
        SourceSignature::of(self.source.path())
    }

    /// Register the current signature with the cache and return its fingerprint.
    ///
    /// Covers everything the prepared table depends on, so pipelines with
    /// different references or thresholds never read each other's entries.
    fn fingerprint(&self, cache: &PipelineCache) -> Result<String> {
        let fingerprint = format!(
            "{}|{}|geo={}|threshold={}",
            match self.source {
                DataSource::Raw(_) => "raw",
                DataSource::Cleaned(_) => "cleaned",
            },
            self.signature()?.fingerprint(),
            self.geo_digest,
            self.deriver.config.small_count_threshold
        );
        cache.ensure_signature(&fingerprint)?;
        Ok(fingerprint)
    }

    /// Prepared table together with the fingerprint it was built under
    fn snapshot(&self, cache: &PipelineCache) -> Result<(String, Arc<ObservationTable>)> {
        let fingerprint = self.fingerprint(cache)?;
        let key = CacheKey::new(&fingerprint, FN_PREPARE, &())?;
        let table = cache.cached(&key, || {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let raw = match &self.source {
                DataSource::Raw(path) => ingestion::load(path)?,
                DataSource::Cleaned(path) => ingestion::read_artifact(path)?,
            };
            let harmonized = self.harmonizer.harmonize(raw)?;
            let derived = self.deriver.derive(harmonized)?;
            info!("Prepared table with {} rows", derived.len());
            Ok(derived)
        })?;
        Ok((fingerprint, table))
    }

    /// Load, harmonize and derive; runs once per source signature
    #[instrument(skip(self, cache), fields(source = %self.source.path().display()))]
    pub fn prepared(&self, cache: &PipelineCache) -> Result<Arc<ObservationTable>> {
        Ok(self.snapshot(cache)?.1)
    }

    pub fn geo_aggregate(
        &self,
        cache: &PipelineCache,
        filter: &FilterSpec,
        level: GeoLevel,
    ) -> Result<Arc<GeoAggregate>> {
        let (fingerprint, table) = self.snapshot(cache)?;
        let key = CacheKey::new(&fingerprint, FN_GEO_AGGREGATE, &(filter, level))?;
        cache.cached(&key, || Ok(aggregate::geo_aggregate(&table, &self.geo, filter, level)))
    }

    pub fn hierarchy_aggregate(&self, cache: &PipelineCache, filter: &FilterSpec) -> Result<Arc<PathologyTree>> {
        let (fingerprint, table) = self.snapshot(cache)?;
        let key = CacheKey::new(&fingerprint, FN_HIERARCHY_AGGREGATE, filter)?;
        cache.cached(&key, || Ok(aggregate::hierarchy_aggregate(&table, filter)))
    }

    pub fn correlation_matrix(
        &self,
        cache: &PipelineCache,
        filter: &FilterSpec,
        codes: &[String],
    ) -> Result<Arc<CorrelationMatrix>> {
        let (fingerprint, table) = self.snapshot(cache)?;
        let key = CacheKey::new(&fingerprint, FN_CORRELATION_MATRIX, &(filter, codes))?;
        cache.cached(&key, || Ok(aggregate::correlation_matrix(&table, filter, codes)))
    }

    pub fn top_categories(
        &self,
        cache: &PipelineCache,
        filter: &FilterSpec,
        limit: usize,
    ) -> Result<Arc<Vec<CategoryTotal>>> {
        let (fingerprint, table) = self.snapshot(cache)?;
        let key = CacheKey::new(&fingerprint, FN_TOP_CATEGORIES, &(filter, limit))?;
        cache.cached(&key, || Ok(aggregate::top_categories(&table, filter, limit)))
    }

    pub fn prevalence_timeseries(
        &self,
        cache: &PipelineCache,
        filter: &FilterSpec,
    ) -> Result<Arc<Vec<TimeseriesPoint>>> {
        let (fingerprint, table) = self.snapshot(cache)?;
        let key = CacheKey::new(&fingerprint, FN_TIMESERIES, filter)?;
        cache.cached(&key, || Ok(aggregate::prevalence_timeseries(&table, filter)))
    }

    pub fn summary(&self, cache: &PipelineCache, filter: &FilterSpec) -> Result<Arc<Summary>> {
        let (fingerprint, table) = self.snapshot(cache)?;
        let key = CacheKey::new(&fingerprint, FN_SUMMARY, filter)?;
        cache.cached(&key, || Ok(aggregate::summarize(&table, filter)))
    }

    pub fn total_patients(&self, cache: &PipelineCache, filter: &FilterSpec) -> Result<u64> {
        Ok(self.summary(cache, filter)?.total_patients)
    }

    pub fn distinct_pathologies(&self, cache: &PipelineCache, filter: &FilterSpec) -> Result<u64> {
        Ok(self.summary(cache, filter)?.distinct_pathologies)
    }

    pub fn year_range(&self, cache: &PipelineCache, filter: &FilterSpec) -> Result<Option<(i32, i32)>> {
        Ok(self.summary(cache, filter)?.year_range)
    }

    pub fn quality_report(&self, cache: &PipelineCache) -> Result<Arc<DataQualityReport>> {
        let (fingerprint, table) = self.snapshot(cache)?;
        let key = CacheKey::new(&fingerprint, FN_QUALITY_REPORT, &())?;
        cache.cached(&key, || Ok(DataQualityReport::build(&table)))
    }

    /// Persist the prepared table so later runs can skip the raw CSV
    pub fn write_clean_artifact<P: AsRef<Path> + std::fmt::Debug>(&self, cache: &PipelineCache, path: P) -> Result<()> {
        let table = self.prepared(cache)?;
        ingestion::write_artifact(&table, path)
    }
}
