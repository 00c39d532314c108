use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::FilterSpec;
use crate::constants::RATE_SCALE;
use crate::domain::{AgeBand, Observation, ObservationTable, Sex};

/// Symmetric matrix of Pearson coefficients between top-level categories.
///
/// `values[i][j]` is `None` when the pair shares fewer than two cells or one
/// side has no variance across them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub codes: Vec<String>,
    pub labels: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
    /// Cells both categories were observed in
    pub support: Vec<Vec<usize>>,
}

/// One off-diagonal entry of the matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub a: String,
    pub b: String,
    pub coefficient: f64,
    pub support: usize,
}

/// Patient total of one top-level category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub code: String,
    pub label: String,
    pub patient_count: u64,
}

impl CorrelationMatrix {
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.codes.iter().position(|c| c == a)?;
        let j = self.codes.iter().position(|c| c == b)?;
        self.values[i][j]
    }

    /// Defined off-diagonal pairs, strongest absolute coefficient first
    pub fn strongest_pairs(&self, limit: usize) -> Vec<CorrelationPair> {
        let mut pairs = Vec::new();
        for i in 0..self.codes.len() {
            for j in (i + 1)..self.codes.len() {
                if let Some(coefficient) = self.values[i][j] {
                    pairs.push(CorrelationPair {
                        a: self.codes[i].clone(),
                        b: self.codes[j].clone(),
                        coefficient,
                        support: self.support[i][j],
                    });
                }
            }
        }
        pairs.sort_by(|x, y| {
            y.coefficient
                .abs()
                .total_cmp(&x.coefficient.abs())
                .then_with(|| x.a.cmp(&y.a))
                .then_with(|| x.b.cmp(&y.b))
        });
        pairs.truncate(limit);
        pairs
    }
}

/// Cells the correlation is computed over
type Cell = (String, i32, AgeBand, Sex);

#[derive(Default)]
struct CellAccumulator {
    patients: u64,
    /// Population per department; every pathology row of a department repeats it
    population: BTreeMap<String, u64>,
}

impl CellAccumulator {
    fn rate(&self) -> Option<f64> {
        let population: u64 = self.population.values().sum();
        (population > 0).then(|| self.patients as f64 * RATE_SCALE / population as f64)
    }
}

fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len();
    if n < 2 {
        return None;
    }
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Rows feeding per-category figures, each paired with its top-level code.
///
/// With `filter.pathology_level` set only rows at that level are read. Without
/// it only taxonomy leaves are read, so a category is counted once and its
/// total equals its treemap value even when its root has no rows of its own.
fn category_rows<'a>(table: &'a ObservationTable, filter: &FilterSpec) -> Vec<(&'a str, &'a Observation)> {
    let parents: HashSet<&str> = table
        .taxonomy
        .nodes()
        .filter_map(|n| n.parent_code.as_deref())
        .collect();
    table
        .rows
        .iter()
        .filter(|r| match filter.pathology_level {
            Some(level) => r.pathology_level == level,
            None => !parents.contains(r.pathology_code.as_str()),
        })
        .filter(|r| filter.matches_ignoring_level(r, &table.taxonomy))
        .map(|r| {
            let top = table
                .taxonomy
                .top_level_of(&r.pathology_code)
                .unwrap_or(r.pathology_code.as_str());
            (top, r)
        })
        .collect()
}

/// Correlate prevalence rates of the given top-level categories.
///
/// Rows are read at `filter.pathology_level`, or at the taxonomy leaves when
/// it is unset, and rolled up to their top-level category; a rate is then
/// formed per (region, year, age band, sex) cell.
/// Codes keep the order they were given in.
///
/// An empty matrix means the filter selected no rows. When rows were selected
/// but a requested code has none of them, that code still gets a row and
/// column: unit diagonal, `None` elsewhere and zero support.
pub fn correlation_matrix(table: &ObservationTable, filter: &FilterSpec, codes: &[String]) -> CorrelationMatrix {
    let mut selected: Vec<&str> = Vec::with_capacity(codes.len());
    for code in codes {
        if !selected.contains(&code.as_str()) {
            selected.push(code.as_str());
        }
    }
    let index: HashMap<&str, usize> = selected.iter().enumerate().map(|(i, c)| (*c, i)).collect();

    let rows = category_rows(table, filter);
    if rows.is_empty() {
        return CorrelationMatrix::default();
    }
    let mut cells: Vec<HashMap<Cell, CellAccumulator>> = (0..selected.len()).map(|_| HashMap::new()).collect();
    for (top, row) in rows {
        let (Some(&i), Some(&sex), Some(&band), Some(population)) = (
            index.get(top),
            row.sex.canonical(),
            row.age_band.canonical(),
            row.population,
        ) else {
            continue;
        };
        let acc = cells[i]
            .entry((row.region_code.clone(), row.year, band, sex))
            .or_default();
        acc.patients += row.patient_count;
        acc.population.entry(row.department_code.clone()).or_insert(population);
    }

    let rates: Vec<HashMap<&Cell, f64>> = cells
        .iter()
        .map(|m| m.iter().filter_map(|(cell, acc)| acc.rate().map(|r| (cell, r))).collect())
        .collect();

    let n = selected.len();
    let mut values = vec![vec![None; n]; n];
    let mut support = vec![vec![0usize; n]; n];
    for i in 0..n {
        values[i][i] = Some(1.0);
        support[i][i] = rates[i].len();
        for j in (i + 1)..n {
            let mut xs = Vec::new();
            let mut ys = Vec::new();
            for (cell, x) in &rates[i] {
                if let Some(y) = rates[j].get(cell) {
                    xs.push(*x);
                    ys.push(*y);
                }
            }
            let r = pearson(&xs, &ys);
            values[i][j] = r;
            values[j][i] = r;
            support[i][j] = xs.len();
            support[j][i] = xs.len();
        }
    }

    CorrelationMatrix {
        labels: selected.iter().map(|c| table.taxonomy.label_of(c).to_string()).collect(),
        codes: selected.into_iter().map(str::to_string).collect(),
        values,
        support,
    }
}

/// Top-level categories ranked by patient count within the filter.
///
/// Without a pathology level the totals match the treemap's root values.
pub fn top_categories(table: &ObservationTable, filter: &FilterSpec, limit: usize) -> Vec<CategoryTotal> {
    let mut totals: HashMap<&str, u64> = HashMap::new();
    for (top, row) in category_rows(table, filter) {
        *totals.entry(top).or_insert(0) += row.patient_count;
    }
    let mut ranked: Vec<CategoryTotal> = totals
        .into_iter()
        .map(|(code, patient_count)| CategoryTotal {
            code: code.to_string(),
            label: table.taxonomy.label_of(code).to_string(),
            patient_count,
        })
        .collect();
    ranked.sort_by(|a, b| b.patient_count.cmp(&a.patient_count).then_with(|| a.code.cmp(&b.code)));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Coded, PathologyLevel, PathologyTaxonomy};
    use crate::pipeline::aggregate::hierarchy_aggregate;

    fn row(dept: &str, year: i32, code: &str, label: &str, count: u64, population: u64) -> Observation {
        Observation {
            region_code: "11".to_string(),
            department_code: dept.to_string(),
            sex: Coded::Canonical(Sex::Both),
            age_band: Coded::Canonical(AgeBand::Band(70)),
            year,
            pathology_code: code.to_string(),
            pathology_level: PathologyLevel::Top,
            pathology_path: vec![label.to_string()],
            patient_count: count,
            population: Some(population),
            geo_resolved: true,
            prevalence_rate: None,
            low_confidence: false,
        }
    }

    fn table(rows: Vec<Observation>) -> ObservationTable {
        let taxonomy = PathologyTaxonomy::from_paths(
            rows.iter()
                .map(|r| (r.pathology_code.as_str(), r.pathology_path.as_slice())),
        )
        .unwrap();
        ObservationTable {
            rows,
            taxonomy,
            ..ObservationTable::default()
        }
    }

    fn deep_row(year: i32, code: &str, path: &[&str], count: u64) -> Observation {
        Observation {
            pathology_level: PathologyLevel::from_depth(path.len()),
            pathology_path: path.iter().map(|s| s.to_string()).collect(),
            ..row("75", year, code, path[0], count, 10_000)
        }
    }

    fn sample() -> ObservationTable {
        table(vec![
            row("75", 2020, "DIAB", "Diabète", 100, 10_000),
            row("75", 2021, "DIAB", "Diabète", 200, 10_000),
            row("75", 2022, "DIAB", "Diabète", 300, 10_000),
            row("75", 2020, "CARD", "Cardio", 10, 10_000),
            row("75", 2021, "CARD", "Cardio", 20, 10_000),
            row("75", 2022, "CARD", "Cardio", 30, 10_000),
            row("75", 2020, "RESP", "Respiratoire", 30, 10_000),
            row("75", 2021, "RESP", "Respiratoire", 20, 10_000),
            row("75", 2022, "RESP", "Respiratoire", 10, 10_000),
        ])
    }

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matrix_is_symmetric_with_unit_diagonal() {
        let m = correlation_matrix(&sample(), &FilterSpec::all(), &codes(&["DIAB", "CARD", "RESP"]));
        assert_eq!(m.len(), 3);
        for i in 0..3 {
            assert_eq!(m.values[i][i], Some(1.0));
            for j in 0..3 {
                assert_eq!(m.values[i][j], m.values[j][i]);
            }
        }
        assert!((m.get("DIAB", "CARD").unwrap() - 1.0).abs() < 1e-9);
        assert!((m.get("DIAB", "RESP").unwrap() + 1.0).abs() < 1e-9);
        assert_eq!(m.support[0][1], 3);
        assert_eq!(m.labels[0], "Diabète");
    }

    #[test]
    fn test_too_few_common_cells_is_undefined() {
        let m = correlation_matrix(
            &sample(),
            &FilterSpec::all().with_years([2022]),
            &codes(&["DIAB", "CARD"]),
        );
        assert_eq!(m.get("DIAB", "CARD"), None);
        assert_eq!(m.get("DIAB", "DIAB"), Some(1.0));
    }

    #[test]
    fn test_department_populations_are_summed_once_per_cell() {
        let t = table(vec![
            row("75", 2020, "DIAB", "Diabète", 100, 10_000),
            row("92", 2020, "DIAB", "Diabète", 100, 30_000),
            row("75", 2021, "DIAB", "Diabète", 20, 10_000),
            row("75", 2020, "CARD", "Cardio", 1, 10_000),
            row("75", 2021, "CARD", "Cardio", 2, 10_000),
        ]);
        let m = correlation_matrix(&t, &FilterSpec::all(), &codes(&["DIAB", "CARD"]));
        // 2020: 200 / 40_000 = 50, 2021: 20 / 10_000 = 20, against rising CARD rates
        assert!((m.get("DIAB", "CARD").unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_selection_gives_empty_matrix() {
        let m = correlation_matrix(&sample(), &FilterSpec::all().with_years([1990]), &codes(&["DIAB"]));
        assert!(m.is_empty());
    }

    #[test]
    fn test_strongest_pairs_and_top_categories() {
        let t = sample();
        let m = correlation_matrix(&t, &FilterSpec::all(), &codes(&["DIAB", "CARD", "RESP"]));
        let pairs = m.strongest_pairs(10);
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|p| p.coefficient.abs() > 0.99));

        let top = top_categories(&t, &FilterSpec::all(), 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].code, "DIAB");
        assert_eq!(top[0].patient_count, 600);
        assert_eq!(top[1].code, "CARD");
    }

    #[test]
    fn test_categories_without_rows_of_their_own_are_rolled_up_from_leaves() {
        let cancer = ["Cancers", "Cancer du sein", "Cancer du sein actif"];
        let cardio = ["Cardio", "Maladie coronaire", "Maladie coronaire chronique"];
        let t = table(vec![
            deep_row(2020, "CAN_ACT", &cancer, 100),
            deep_row(2021, "CAN_ACT", &cancer, 200),
            deep_row(2022, "CAN_ACT", &cancer, 300),
            deep_row(2020, "CORO", &cardio, 50),
            deep_row(2021, "CORO", &cardio, 100),
            deep_row(2022, "CORO", &cardio, 150),
        ]);

        let top = top_categories(&t, &FilterSpec::all(), 5);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].code, "path:Cancers");
        assert_eq!(top[0].label, "Cancers");
        assert_eq!(top[0].patient_count, 600);
        assert_eq!(top[1].patient_count, 300);

        let tree = hierarchy_aggregate(&t, &FilterSpec::all());
        for category in &top {
            assert_eq!(tree.find(&category.code).unwrap().value, category.patient_count);
        }

        let selection: Vec<String> = top.iter().map(|c| c.code.clone()).collect();
        let m = correlation_matrix(&t, &FilterSpec::all(), &selection);
        assert_eq!(m.len(), 2);
        assert!((m.get("path:Cancers", "path:Cardio").unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(m.support[0][1], 3);
    }

    #[test]
    fn test_category_total_ignores_rows_of_internal_nodes() {
        let t = table(vec![
            deep_row(2020, "CAN", &["Cancers"], 999),
            deep_row(2020, "CAN_ACT", &["Cancers", "Cancer du sein", "Cancer du sein actif"], 40),
            deep_row(2020, "CAN_SURV", &["Cancers", "Cancer du sein", "Cancer du sein sous surveillance"], 60),
        ]);
        let top = top_categories(&t, &FilterSpec::all(), 5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].code, "CAN");
        assert_eq!(top[0].patient_count, 100);

        let own_level = top_categories(&t, &FilterSpec::all().with_level(PathologyLevel::Top), 5);
        assert_eq!(own_level[0].patient_count, 999);
    }

    #[test]
    fn test_requested_code_without_rows_keeps_its_slot() {
        let m = correlation_matrix(&sample(), &FilterSpec::all(), &codes(&["DIAB", "ABSENT"]));
        assert_eq!(m.len(), 2);
        assert_eq!(m.values[1][1], Some(1.0));
        assert_eq!(m.get("DIAB", "ABSENT"), None);
        assert_eq!(m.support[1], vec![0, 0]);
    }
}
