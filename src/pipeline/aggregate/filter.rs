use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::{AgeBand, Observation, ObservationTable, PathologyLevel, PathologyTaxonomy, Sex};
use crate::pipeline::processing::harmonize::normalize_region_code;

/// The subset of the dataset a query works on.
///
/// `None` selects everything along that axis; `Some(set)` selects only the
/// listed values, so `Some` of an empty set selects nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSpec {
    pub regions: Option<BTreeSet<String>>,
    pub years: Option<BTreeSet<i32>>,
    pub sexes: Option<BTreeSet<Sex>>,
    pub age_bands: Option<BTreeSet<AgeBand>>,
    /// Restricts rows to one taxonomy level; for hierarchies it bounds the tree depth
    pub pathology_level: Option<PathologyLevel>,
    /// Pathology codes; a row matches when its code or any ancestor is listed
    pub pathology_codes: Option<BTreeSet<String>>,
}

fn subset<T: Ord>(narrow: &Option<BTreeSet<T>>, wide: &Option<BTreeSet<T>>) -> bool {
    match (narrow, wide) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(n), Some(w)) => n.is_subset(w),
    }
}

fn admits<T: Ord>(selection: &Option<BTreeSet<T>>, value: &T) -> bool {
    selection.as_ref().map_or(true, |s| s.contains(value))
}

impl FilterSpec {
    /// Selects every row
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.regions = Some(regions.into_iter().map(|r| normalize_region_code(r.as_ref())).collect());
        self
    }

    pub fn with_years<I: IntoIterator<Item = i32>>(mut self, years: I) -> Self {
        self.years = Some(years.into_iter().collect());
        self
    }

    pub fn with_sexes<I: IntoIterator<Item = Sex>>(mut self, sexes: I) -> Self {
        self.sexes = Some(sexes.into_iter().collect());
        self
    }

    pub fn with_age_bands<I: IntoIterator<Item = AgeBand>>(mut self, bands: I) -> Self {
        self.age_bands = Some(bands.into_iter().collect());
        self
    }

    pub fn with_level(mut self, level: PathologyLevel) -> Self {
        self.pathology_level = Some(level);
        self
    }

    pub fn with_pathologies<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pathology_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    /// True when every row this filter admits is also admitted by `wider`
    pub fn is_subset_of(&self, wider: &FilterSpec) -> bool {
        subset(&self.regions, &wider.regions)
            && subset(&self.years, &wider.years)
            && subset(&self.sexes, &wider.sexes)
            && subset(&self.age_bands, &wider.age_bands)
            && subset(&self.pathology_codes, &wider.pathology_codes)
            && match (self.pathology_level, wider.pathology_level) {
                (_, None) => true,
                (Some(a), Some(b)) => a == b,
                (None, Some(_)) => false,
            }
    }

    /// Every dimension except the pathology level
    pub fn matches_ignoring_level(&self, row: &Observation, taxonomy: &PathologyTaxonomy) -> bool {
        if !admits(&self.regions, &row.region_code) || !admits(&self.years, &row.year) {
            return false;
        }
        if let Some(sexes) = &self.sexes {
            match row.sex.canonical() {
                Some(sex) if sexes.contains(sex) => {}
                _ => return false,
            }
        }
        if let Some(bands) = &self.age_bands {
            match row.age_band.canonical() {
                Some(band) if bands.contains(band) => {}
                _ => return false,
            }
        }
        if let Some(codes) = &self.pathology_codes {
            let lineage = taxonomy.lineage(&row.pathology_code);
            let hit = if lineage.is_empty() {
                codes.contains(&row.pathology_code)
            } else {
                lineage.iter().any(|c| codes.contains(*c))
            };
            if !hit {
                return false;
            }
        }
        true
    }

    pub fn matches(&self, row: &Observation, taxonomy: &PathologyTaxonomy) -> bool {
        self.pathology_level.map_or(true, |level| row.pathology_level == level)
            && self.matches_ignoring_level(row, taxonomy)
    }

    /// Rows of the table admitted by this filter
    pub fn select<'a>(&'a self, table: &'a ObservationTable) -> impl Iterator<Item = &'a Observation> + 'a {
        table.rows.iter().filter(move |r| self.matches(r, &table.taxonomy))
    }
}
