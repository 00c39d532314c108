use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::constants::NATIONAL_TOTAL_DEPARTMENT;
use crate::domain::{AgeBand, Diagnostics, ObservationTable};
use crate::error::Result;

/// Reconstructed national population for one year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationUnion {
    pub year: i32,
    /// Sum over (department, age band) slices of the median published population
    pub population: f64,
    pub slices: u64,
    /// Slices whose rows disagree on the population
    pub multi_valued_slices: u64,
}

/// A (department, age band) slice publishing more than one population value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationConflict {
    pub year: i32,
    pub department_code: String,
    pub age_band: String,
    pub values: Vec<u64>,
}

/// Summary of the prepared table and of everything dropped or flagged on the way
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub rows: u64,
    pub regions: u64,
    pub departments: u64,
    pub pathologies: u64,
    pub years: Vec<i32>,
    pub diagnostics: Diagnostics,
    pub population_by_year: Vec<PopulationUnion>,
    pub population_conflicts: Vec<PopulationConflict>,
}

fn median(values: &mut [u64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] as f64 + values[mid] as f64) / 2.0
    } else {
        values[mid] as f64
    })
}

impl DataQualityReport {
    /// Build the report from a harmonized table
    pub fn build(table: &ObservationTable) -> Self {
        let mut regions = BTreeSet::new();
        let mut departments = BTreeSet::new();
        let mut years = BTreeSet::new();
        let mut slices: BTreeMap<(i32, &str, AgeBand), Vec<u64>> = BTreeMap::new();

        for row in &table.rows {
            if !row.region_code.is_empty() {
                regions.insert(row.region_code.as_str());
            }
            departments.insert(row.department_code.as_str());
            years.insert(row.year);

            if row.department_code == NATIONAL_TOTAL_DEPARTMENT {
                continue;
            }
            let (Some(&band), Some(population)) = (row.age_band.canonical(), row.population) else {
                continue;
            };
            if band == AgeBand::Unknown {
                continue;
            }
            slices
                .entry((row.year, row.department_code.as_str(), band))
                .or_default()
                .push(population);
        }

        let mut by_year: BTreeMap<i32, PopulationUnion> = BTreeMap::new();
        let mut conflicts = Vec::new();
        for ((year, department, band), mut values) in slices {
            let distinct: BTreeSet<u64> = values.iter().copied().collect();
            let entry = by_year.entry(year).or_insert(PopulationUnion {
                year,
                population: 0.0,
                slices: 0,
                multi_valued_slices: 0,
            });
            entry.slices += 1;
            if distinct.len() > 1 {
                entry.multi_valued_slices += 1;
                conflicts.push(PopulationConflict {
                    year,
                    department_code: department.to_string(),
                    age_band: band.label(),
                    values: distinct.into_iter().collect(),
                });
            }
            entry.population += median(&mut values).unwrap_or(0.0);
        }
        if !conflicts.is_empty() {
            warn!("{} population slices publish more than one value", conflicts.len());
        }

        Self {
            generated_at: Utc::now(),
            source: table.diagnostics.load.source_name.clone(),
            rows: table.len() as u64,
            regions: regions.len() as u64,
            departments: departments.len() as u64,
            pathologies: table.taxonomy.len() as u64,
            years: years.into_iter().collect(),
            diagnostics: table.diagnostics.clone(),
            population_by_year: by_year.into_values().collect(),
            population_conflicts: conflicts,
        }
    }

    /// Rows that need a warning badge in a front end
    pub fn warning_rows(&self) -> u64 {
        self.diagnostics.warning_rows()
    }

    /// Write the report as pretty-printed JSON
    #[instrument(skip(self))]
    pub fn write_report<P: AsRef<Path> + std::fmt::Debug>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Wrote data quality report to {}", path.display());
        Ok(())
    }
}
