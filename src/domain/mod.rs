//! Canonical data shapes shared by every pipeline stage

pub mod taxonomy;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use taxonomy::{PathologyNode, PathologyTaxonomy};

/// Sex as published, after harmonization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
    Both,
}

impl Sex {
    pub const ALL: [Sex; 3] = [Sex::Male, Sex::Female, Sex::Both];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
            Sex::Both => "both",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Five-year age bands, `0-4` through `95+`, plus an explicit unknown bucket.
///
/// `Band` holds the lower bound; variant order gives the canonical ordering
/// with `Unknown` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgeBand {
    Band(u8),
    Unknown,
}

impl AgeBand {
    /// Lower bound of the open-ended top band
    pub const OPEN_LOWER: u8 = 95;
    pub const WIDTH: u8 = 5;

    pub fn from_lower(lower: u8) -> Option<Self> {
        if lower % Self::WIDTH == 0 && lower <= Self::OPEN_LOWER {
            Some(AgeBand::Band(lower))
        } else {
            None
        }
    }

    /// Every canonical band in order, `unknown` included
    pub fn all() -> Vec<AgeBand> {
        (0..=Self::OPEN_LOWER)
            .step_by(Self::WIDTH as usize)
            .map(AgeBand::Band)
            .chain(std::iter::once(AgeBand::Unknown))
            .collect()
    }

    pub fn label(&self) -> String {
        match self {
            AgeBand::Band(lower) if *lower >= Self::OPEN_LOWER => format!("{}+", lower),
            AgeBand::Band(lower) => format!("{}-{}", lower, lower + Self::WIDTH - 1),
            AgeBand::Unknown => "unknown".to_string(),
        }
    }

    /// Parse a canonical label (`0-4`, `95+`, `unknown`); source spellings go through the harmonizer
    pub fn parse_canonical(label: &str) -> Option<Self> {
        if label == "unknown" {
            return Some(AgeBand::Unknown);
        }
        if let Some(lower) = label.strip_suffix('+') {
            let lower: u8 = lower.parse().ok()?;
            return (lower == Self::OPEN_LOWER).then_some(AgeBand::Band(lower));
        }
        let (lo, hi) = label.split_once('-')?;
        let lo: u8 = lo.parse().ok()?;
        let hi: u8 = hi.parse().ok()?;
        let band = Self::from_lower(lo)?;
        (lo < Self::OPEN_LOWER && hi == lo + Self::WIDTH - 1).then_some(band)
    }
}

impl fmt::Display for AgeBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl From<AgeBand> for String {
    fn from(band: AgeBand) -> Self {
        band.label()
    }
}

impl TryFrom<String> for AgeBand {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AgeBand::parse_canonical(&value).ok_or_else(|| format!("not a canonical age band: {}", value))
    }
}

/// A categorical value that is either still in its source spelling or already canonical
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coded<T> {
    Raw(String),
    Canonical(T),
}

impl<T> Coded<T> {
    pub fn canonical(&self) -> Option<&T> {
        match self {
            Coded::Canonical(value) => Some(value),
            Coded::Raw(_) => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Coded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coded::Raw(raw) => write!(f, "raw:{}", raw),
            Coded::Canonical(value) => value.fmt(f),
        }
    }
}

/// Level of a pathology within the taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathologyLevel {
    Top,
    Intermediate,
    Leaf,
}

impl PathologyLevel {
    /// Level for a label path of the given depth (1-based); deeper paths clamp to leaf
    pub fn from_depth(depth: usize) -> Self {
        match depth {
            0 | 1 => PathologyLevel::Top,
            2 => PathologyLevel::Intermediate,
            _ => PathologyLevel::Leaf,
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            PathologyLevel::Top => 1,
            PathologyLevel::Intermediate => 2,
            PathologyLevel::Leaf => 3,
        }
    }
}

impl fmt::Display for PathologyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PathologyLevel::Top => "top",
            PathologyLevel::Intermediate => "intermediate",
            PathologyLevel::Leaf => "leaf",
        };
        f.write_str(s)
    }
}

/// One row of canonical data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub region_code: String,
    pub department_code: String,
    pub sex: Coded<Sex>,
    pub age_band: Coded<AgeBand>,
    pub year: i32,
    pub pathology_code: String,
    pub pathology_level: PathologyLevel,
    /// Taxonomy labels from the top-level category down to this row's pathology
    pub pathology_path: Vec<String>,
    pub patient_count: u64,
    /// Denominator; `None` when missing or published as zero
    pub population: Option<u64>,
    /// Whether the department code resolved against the geographic reference
    pub geo_resolved: bool,
    /// Patients per 10,000 inhabitants; `None` marks an undefined denominator
    pub prevalence_rate: Option<f64>,
    /// Patient count below the disclosure-control threshold
    pub low_confidence: bool,
}

impl Observation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            region_code: self.region_code.clone(),
            department_code: self.department_code.clone(),
            sex: self.sex.to_string(),
            age_band: self.age_band.to_string(),
            year: self.year,
            pathology_code: self.pathology_code.clone(),
        }
    }
}

/// Full identity of an observation, used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservationKey {
    pub region_code: String,
    pub department_code: String,
    pub sex: String,
    pub age_band: String,
    pub year: i32,
    pub pathology_code: String,
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(region={}, dept={}, sex={}, age={}, year={}, pathology={})",
            self.region_code, self.department_code, self.sex, self.age_band, self.year, self.pathology_code
        )
    }
}

/// Why the loader dropped a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    MalformedRecord,
    BadYear,
    BadPatientCount,
    BadPopulation,
    MissingCode,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExclusionReason::MalformedRecord => "malformed_record",
            ExclusionReason::BadYear => "bad_year",
            ExclusionReason::BadPatientCount => "bad_patient_count",
            ExclusionReason::BadPopulation => "bad_population",
            ExclusionReason::MissingCode => "missing_code",
        };
        f.write_str(s)
    }
}

/// Side-channel report of a raw load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Display name of the source (file name)
    pub source_name: String,
    /// Field delimiter detected in the source
    pub delimiter: char,
    /// Data rows read, excluded ones included
    pub rows_read: u64,
    /// Rows that made it into the table
    pub rows_loaded: u64,
    /// Rows dropped during coercion, by reason
    pub excluded: BTreeMap<ExclusionReason, u64>,
    /// Rows whose published population was zero (kept, stored as missing)
    pub zero_population: u64,
}

impl LoadReport {
    pub fn excluded_total(&self) -> u64 {
        self.excluded.values().sum()
    }

    pub fn exclude(&mut self, reason: ExclusionReason) {
        *self.excluded.entry(reason).or_insert(0) += 1;
    }
}

/// A department code that did not resolve against the geographic reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoResolutionWarning {
    pub department_code: String,
    /// Rows carrying this code
    pub rows: u64,
}

/// Row-level conditions accumulated across stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub load: LoadReport,
    /// Rows dropped because their sex value is not in the mapping table
    pub unmapped_sex: u64,
    /// Rows whose age band fell into the `unknown` bucket
    pub unknown_age_band: u64,
    /// Identical duplicate rows collapsed into one
    pub duplicates_merged: u64,
    /// Unresolved department codes, sorted by code
    pub geo_warnings: Vec<GeoResolutionWarning>,
    /// Rows flagged below the small-count threshold
    pub low_confidence_rows: u64,
    /// Rows whose prevalence rate is undefined
    pub missing_denominator_rows: u64,
}

impl Diagnostics {
    pub fn geo_unresolved_rows(&self) -> u64 {
        self.geo_warnings.iter().map(|w| w.rows).sum()
    }

    /// Rows excluded or left unresolved; drives the warning badge
    pub fn warning_rows(&self) -> u64 {
        self.load.excluded_total() + self.unmapped_sex + self.geo_unresolved_rows()
    }
}

/// The in-memory table passed between stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationTable {
    pub rows: Vec<Observation>,
    pub taxonomy: PathologyTaxonomy,
    pub diagnostics: Diagnostics,
}

impl ObservationTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
