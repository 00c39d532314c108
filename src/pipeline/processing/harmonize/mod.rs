//! Harmonizer: canonical categories, geographic resolution, deduplication and taxonomy

pub mod categories;
pub mod geo;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AgeBand, Coded, GeoResolutionWarning, Observation, ObservationTable, PathologyLevel, PathologyTaxonomy,
};
use crate::error::{PipelineError, Result};
use crate::metrics::HarmonizerMetrics;

pub use categories::CategoryTables;
pub use geo::{normalize_department_code, normalize_region_code, BoundaryLayer, Department, GeoReference, GeoUnit};

/// Trait for turning a loaded table into the canonical schema
pub trait Harmonizer {
    /// Normalize a table; applying it to an already harmonized table is a no-op
    fn harmonize(&self, table: ObservationTable) -> Result<ObservationTable>;
}

/// Default harmonizer backed by the category tables and a geographic reference
pub struct DefaultHarmonizer {
    geo: Arc<GeoReference>,
    categories: CategoryTables,
}

/// Drop labels that repeat their parent's label (`Diabète > Diabète`)
pub fn collapse_path(path: &[String]) -> Vec<String> {
    let mut collapsed: Vec<String> = Vec::with_capacity(path.len());
    for label in path {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        if collapsed.last().map(|l| l.as_str()) != Some(label) {
            collapsed.push(label.to_string());
        }
    }
    collapsed
}

impl DefaultHarmonizer {
    pub fn new(geo: Arc<GeoReference>) -> Result<Self> {
        Ok(Self {
            geo,
            categories: CategoryTables::new()?,
        })
    }

    pub fn geo(&self) -> &GeoReference {
        &self.geo
    }

    /// Canonicalize one row; `None` when the sex value is not in the mapping table
    fn normalize_row(&self, mut row: Observation) -> Option<Observation> {
        if let Coded::Raw(raw) = &row.sex {
            match self.categories.map_sex(raw) {
                Some(sex) => row.sex = Coded::Canonical(sex),
                None => {
                    debug!("Unmapped sex value {:?}", raw);
                    return None;
                }
            }
        }
        if let Coded::Raw(raw) = &row.age_band {
            row.age_band = Coded::Canonical(self.categories.map_age_band(raw));
        }

        row.department_code = normalize_department_code(&row.department_code);
        match self.geo.department(&row.department_code) {
            Some(department) => {
                row.region_code = department.region_code.clone();
                row.geo_resolved = true;
            }
            None => {
                row.region_code = normalize_region_code(&row.region_code);
                row.geo_resolved = false;
            }
        }

        row.pathology_path = collapse_path(&row.pathology_path);
        row.pathology_level = PathologyLevel::from_depth(row.pathology_path.len());
        Some(row)
    }

    /// Collapse identical duplicates; duplicates that disagree on the count are fatal
    fn deduplicate(rows: Vec<Observation>) -> Result<(Vec<Observation>, u64)> {
        let mut seen: HashMap<crate::domain::ObservationKey, usize> = HashMap::with_capacity(rows.len());
        let mut kept: Vec<Observation> = Vec::with_capacity(rows.len());
        let mut merged = 0u64;

        for row in rows {
            let key = row.key();
            match seen.get(&key) {
                Some(&idx) => {
                    let first = &kept[idx];
                    if first.patient_count != row.patient_count {
                        return Err(PipelineError::Consistency {
                            key: key.to_string(),
                            first: first.patient_count,
                            second: row.patient_count,
                        });
                    }
                    if first.population != row.population {
                        debug!("Duplicate {} disagrees on population, keeping the first", key);
                    }
                    merged += 1;
                }
                None => {
                    seen.insert(key, kept.len());
                    kept.push(row);
                }
            }
        }
        Ok((kept, merged))
    }
}

impl Harmonizer for DefaultHarmonizer {
    #[instrument(skip(self, table), fields(rows = table.len()))]
    fn harmonize(&self, table: ObservationTable) -> Result<ObservationTable> {
        let started = Instant::now();
        let ObservationTable {
            rows,
            mut diagnostics,
            ..
        } = table;

        let mut unmapped_sex = 0u64;
        let normalized: Vec<Observation> = rows
            .into_iter()
            .filter_map(|row| {
                let out = self.normalize_row(row);
                if out.is_none() {
                    unmapped_sex += 1;
                }
                out
            })
            .collect();

        let (rows, merged) = Self::deduplicate(normalized)?;

        let taxonomy = PathologyTaxonomy::from_paths(
            rows.iter()
                .map(|r| (r.pathology_code.as_str(), r.pathology_path.as_slice())),
        )?;

        let mut unresolved: BTreeMap<&str, u64> = BTreeMap::new();
        for row in rows.iter().filter(|r| !r.geo_resolved) {
            *unresolved.entry(row.department_code.as_str()).or_insert(0) += 1;
        }
        let geo_warnings: Vec<GeoResolutionWarning> = unresolved
            .into_iter()
            .map(|(code, count)| GeoResolutionWarning {
                department_code: code.to_string(),
                rows: count,
            })
            .collect();

        diagnostics.unmapped_sex += unmapped_sex;
        diagnostics.duplicates_merged += merged;
        diagnostics.unknown_age_band = rows
            .iter()
            .filter(|r| r.age_band == Coded::Canonical(AgeBand::Unknown))
            .count() as u64;
        diagnostics.geo_warnings = geo_warnings;

        if unmapped_sex > 0 {
            warn!("Excluded {} rows with unmapped sex values", unmapped_sex);
        }
        if !diagnostics.geo_warnings.is_empty() {
            warn!(
                "{} rows across {} department codes did not resolve geographically",
                diagnostics.geo_unresolved_rows(),
                diagnostics.geo_warnings.len()
            );
        }
        info!(
            "Harmonized {} rows ({} duplicates merged, {} pathologies)",
            rows.len(),
            merged,
            taxonomy.len()
        );
        HarmonizerMetrics::record(&diagnostics, unmapped_sex, merged, started.elapsed().as_secs_f64());

        Ok(ObservationTable {
            rows,
            taxonomy,
            diagnostics,
        })
    }
}
