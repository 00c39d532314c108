use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::FilterSpec;
use crate::domain::ObservationTable;

/// Headline figures for the current filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub rows: u64,
    pub total_patients: u64,
    pub distinct_pathologies: u64,
    pub year_range: Option<(i32, i32)>,
    pub low_confidence_rows: u64,
}

/// One year of the prevalence time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    pub year: i32,
    pub patient_count: u64,
    pub population: u64,
    pub prevalence_rate: Option<f64>,
    pub low_confidence: bool,
}

/// Sum of patient counts over the filtered rows.
///
/// Without a level restriction a patient counted at several taxonomy levels
/// is counted at each of them.
pub fn total_patients(table: &ObservationTable, filter: &FilterSpec) -> u64 {
    filter.select(table).map(|r| r.patient_count).sum()
}

pub fn distinct_pathologies(table: &ObservationTable, filter: &FilterSpec) -> u64 {
    filter
        .select(table)
        .map(|r| r.pathology_code.as_str())
        .collect::<BTreeSet<_>>()
        .len() as u64
}

/// First and last year present; `None` when nothing matches
pub fn year_range(table: &ObservationTable, filter: &FilterSpec) -> Option<(i32, i32)> {
    filter.select(table).fold(None, |range, r| match range {
        None => Some((r.year, r.year)),
        Some((lo, hi)) => Some((lo.min(r.year), hi.max(r.year))),
    })
}

pub fn summarize(table: &ObservationTable, filter: &FilterSpec) -> Summary {
    let mut summary = Summary::default();
    let mut codes = BTreeSet::new();
    for row in filter.select(table) {
        summary.rows += 1;
        summary.total_patients += row.patient_count;
        if row.low_confidence {
            summary.low_confidence_rows += 1;
        }
        codes.insert(row.pathology_code.as_str());
        summary.year_range = Some(match summary.year_range {
            None => (row.year, row.year),
            Some((lo, hi)) => (lo.min(row.year), hi.max(row.year)),
        });
    }
    summary.distinct_pathologies = codes.len() as u64;
    summary
}

/// Patients and population-weighted rate per year, ascending
pub fn prevalence_timeseries(table: &ObservationTable, filter: &FilterSpec) -> Vec<TimeseriesPoint> {
    #[derive(Default)]
    struct Year {
        patients: u64,
        weighted: f64,
        population: u64,
        low: bool,
    }

    let mut years: BTreeMap<i32, Year> = BTreeMap::new();
    for row in filter.select(table) {
        let y = years.entry(row.year).or_default();
        y.patients += row.patient_count;
        y.low |= row.low_confidence;
        if let (Some(rate), Some(population)) = (row.prevalence_rate, row.population) {
            y.weighted += rate * population as f64;
            y.population += population;
        }
    }
    years
        .into_iter()
        .map(|(year, y)| TimeseriesPoint {
            year,
            patient_count: y.patients,
            population: y.population,
            prevalence_rate: (y.population > 0).then(|| y.weighted / y.population as f64),
            low_confidence: y.low,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgeBand, Coded, Observation, PathologyLevel, Sex};

    fn row(year: i32, code: &str, count: u64, population: Option<u64>) -> Observation {
        Observation {
            region_code: "11".to_string(),
            department_code: "75".to_string(),
            sex: Coded::Canonical(Sex::Female),
            age_band: Coded::Canonical(AgeBand::Band(30)),
            year,
            pathology_code: code.to_string(),
            pathology_level: PathologyLevel::Top,
            pathology_path: vec![code.to_string()],
            patient_count: count,
            population,
            geo_resolved: true,
            prevalence_rate: population.map(|p| count as f64 * 10_000.0 / p as f64),
            low_confidence: count < 11,
        }
    }

    fn sample() -> ObservationTable {
        ObservationTable {
            rows: vec![
                row(2021, "DIAB", 100, Some(10_000)),
                row(2022, "DIAB", 150, Some(10_000)),
                row(2022, "CARD", 50, Some(10_000)),
                row(2023, "CARD", 4, None),
            ],
            ..ObservationTable::default()
        }
    }

    #[test]
    fn test_scalar_summaries() {
        let t = sample();
        let filter = FilterSpec::all();
        assert_eq!(total_patients(&t, &filter), 304);
        assert_eq!(distinct_pathologies(&t, &filter), 2);
        assert_eq!(year_range(&t, &filter), Some((2021, 2023)));

        let summary = summarize(&t, &filter);
        assert_eq!(summary.total_patients, 304);
        assert_eq!(summary.low_confidence_rows, 1);
        assert_eq!(summary.year_range, Some((2021, 2023)));
    }

    #[test]
    fn test_empty_selection_summaries() {
        let t = sample();
        let filter = FilterSpec::all().with_sexes(Vec::new());
        assert_eq!(total_patients(&t, &filter), 0);
        assert_eq!(year_range(&t, &filter), None);
        assert!(prevalence_timeseries(&t, &filter).is_empty());
    }

    #[test]
    fn test_timeseries_weights_rates_by_population() {
        let series = prevalence_timeseries(&sample(), &FilterSpec::all());
        assert_eq!(series.len(), 3);
        assert_eq!(series[1].year, 2022);
        assert_eq!(series[1].patient_count, 200);
        assert_eq!(series[1].prevalence_rate, Some(100.0));
        assert_eq!(series[2].prevalence_rate, None);
        assert!(series[2].low_confidence);
    }
}
