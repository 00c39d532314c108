use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::FilterSpec;
use crate::domain::ObservationTable;
use crate::error::PipelineError;
use crate::pipeline::processing::harmonize::GeoReference;

/// Geographic level a map is drawn at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoLevel {
    Department,
    Region,
}

impl fmt::Display for GeoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoLevel::Department => f.write_str("department"),
            GeoLevel::Region => f.write_str("region"),
        }
    }
}

impl FromStr for GeoLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "department" | "dept" | "departement" => Ok(GeoLevel::Department),
            "region" | "reg" => Ok(GeoLevel::Region),
            other => Err(PipelineError::Config(format!("unknown geographic level: {}", other))),
        }
    }
}

/// One geographic unit of a choropleth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoAggregateRow {
    pub code: String,
    pub name: String,
    pub patient_count: u64,
    /// Population over the rows that carry a defined rate
    pub population: u64,
    /// Population-weighted mean of row rates; `None` when no row has a defined rate
    pub prevalence_rate: Option<f64>,
    /// Set when any contributing row is below the small-count threshold
    pub low_confidence: bool,
    pub contributing_rows: u64,
}

/// Aggregated rows keyed by geographic unit, ordered by descending rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoAggregate {
    pub level: GeoLevel,
    pub rows: Vec<GeoAggregateRow>,
    /// Filtered rows left out because their department did not resolve
    pub unresolved_rows: u64,
}

impl GeoAggregate {
    pub fn total_patients(&self) -> u64 {
        self.rows.iter().map(|r| r.patient_count).sum()
    }

    pub fn get(&self, code: &str) -> Option<&GeoAggregateRow> {
        self.rows.iter().find(|r| r.code == code)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Default)]
struct Accumulator {
    patient_count: u64,
    weighted_rate: f64,
    population: u64,
    low_confidence: bool,
    contributing_rows: u64,
}

/// Aggregate the filtered rows to departments or regions.
///
/// Only rows whose department resolved against the reference contribute.
pub fn geo_aggregate(
    table: &ObservationTable,
    geo: &GeoReference,
    filter: &FilterSpec,
    level: GeoLevel,
) -> GeoAggregate {
    let mut units: BTreeMap<&str, Accumulator> = BTreeMap::new();
    let mut unresolved_rows = 0u64;

    for row in filter.select(table) {
        if !row.geo_resolved {
            unresolved_rows += 1;
            continue;
        }
        let code = match level {
            GeoLevel::Department => row.department_code.as_str(),
            GeoLevel::Region => row.region_code.as_str(),
        };
        let acc = units.entry(code).or_default();
        acc.patient_count += row.patient_count;
        acc.low_confidence |= row.low_confidence;
        acc.contributing_rows += 1;
        if let (Some(rate), Some(population)) = (row.prevalence_rate, row.population) {
            acc.weighted_rate += rate * population as f64;
            acc.population += population;
        }
    }

    let mut rows: Vec<GeoAggregateRow> = units
        .into_iter()
        .map(|(code, acc)| {
            let name = match level {
                GeoLevel::Department => geo.department_name(code),
                GeoLevel::Region => geo.region_name(code),
            }
            .unwrap_or(code)
            .to_string();
            GeoAggregateRow {
                code: code.to_string(),
                name,
                patient_count: acc.patient_count,
                population: acc.population,
                prevalence_rate: (acc.population > 0).then(|| acc.weighted_rate / acc.population as f64),
                low_confidence: acc.low_confidence,
                contributing_rows: acc.contributing_rows,
            }
        })
        .collect();

    rows.sort_by(|a, b| match (a.prevalence_rate, b.prevalence_rate) {
        (Some(x), Some(y)) => y.total_cmp(&x).then_with(|| a.code.cmp(&b.code)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.code.cmp(&b.code),
    });

    GeoAggregate {
        level,
        rows,
        unresolved_rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgeBand, Coded, Observation, PathologyLevel, Sex};

    fn reference() -> GeoReference {
        GeoReference::new()
            .with_department("75", "Paris", "11", "Île-de-France")
            .with_department("92", "Hauts-de-Seine", "11", "Île-de-France")
            .with_department("13", "Bouches-du-Rhône", "93", "Provence-Alpes-Côte d'Azur")
    }

    fn row(dept: &str, region: &str, count: u64, population: Option<u64>, resolved: bool) -> Observation {
        Observation {
            region_code: region.to_string(),
            department_code: dept.to_string(),
            sex: Coded::Canonical(Sex::Both),
            age_band: Coded::Canonical(AgeBand::Band(50)),
            year: 2022,
            pathology_code: "DIAB".to_string(),
            pathology_level: PathologyLevel::Top,
            pathology_path: vec!["Diabète".to_string()],
            patient_count: count,
            population,
            geo_resolved: resolved,
            prevalence_rate: population.filter(|p| *p > 0).map(|p| count as f64 * 10_000.0 / p as f64),
            low_confidence: count < 11,
        }
    }

    fn table(rows: Vec<Observation>) -> ObservationTable {
        ObservationTable {
            rows,
            ..ObservationTable::default()
        }
    }

    #[test]
    fn test_region_rate_is_population_weighted() {
        let t = table(vec![
            row("75", "11", 100, Some(10_000), true),
            row("92", "11", 300, Some(30_000), true),
            row("13", "93", 50, Some(10_000), true),
        ]);
        let agg = geo_aggregate(&t, &reference(), &FilterSpec::all(), GeoLevel::Region);
        let idf = agg.get("11").unwrap();
        assert_eq!(idf.patient_count, 400);
        assert_eq!(idf.population, 40_000);
        assert_eq!(idf.prevalence_rate, Some(100.0));
        assert_eq!(idf.name, "Île-de-France");
        assert_eq!(agg.rows[0].code, "11");
        assert_eq!(agg.rows[1].prevalence_rate, Some(50.0));
    }

    #[test]
    fn test_unresolved_rows_are_excluded() {
        let t = table(vec![
            row("75", "11", 100, Some(10_000), true),
            row("999", "", 5000, Some(100_000), false),
        ]);
        let agg = geo_aggregate(&t, &reference(), &FilterSpec::all(), GeoLevel::Department);
        assert_eq!(agg.rows.len(), 1);
        assert_eq!(agg.unresolved_rows, 1);
        assert_eq!(agg.total_patients(), 100);
    }

    #[test]
    fn test_missing_denominator_keeps_count_without_rate() {
        let t = table(vec![row("75", "11", 3, None, true)]);
        let agg = geo_aggregate(&t, &reference(), &FilterSpec::all(), GeoLevel::Department);
        let paris = agg.get("75").unwrap();
        assert_eq!(paris.patient_count, 3);
        assert_eq!(paris.prevalence_rate, None);
        assert!(paris.low_confidence);
    }

    #[test]
    fn test_empty_filter_yields_empty_aggregate() {
        let t = table(vec![row("75", "11", 100, Some(10_000), true)]);
        let filter = FilterSpec::all().with_years([1999]);
        let agg = geo_aggregate(&t, &reference(), &filter, GeoLevel::Region);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_level_parses_from_str() {
        assert_eq!("Region".parse::<GeoLevel>().unwrap(), GeoLevel::Region);
        assert!("canton".parse::<GeoLevel>().is_err());
    }
}
