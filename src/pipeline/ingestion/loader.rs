use csv::{ByteRecord, ReaderBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::constants::{
    COL_AGE_BAND, COL_DEPARTMENT, COL_PATHOLOGY_CODE, COL_PATHOLOGY_LEVEL_1, COL_PATHOLOGY_LEVEL_2,
    COL_PATHOLOGY_LEVEL_3, COL_PATIENT_COUNT, COL_POPULATION, COL_REGION, COL_SEX, COL_YEAR, MAX_YEAR,
    MIN_YEAR, NULL_TOKENS, REQUIRED_COLUMNS, SNIFF_BYTES,
};
use crate::domain::{
    Coded, Diagnostics, ExclusionReason, LoadReport, Observation, ObservationTable, PathologyLevel,
    PathologyTaxonomy,
};
use crate::error::{PipelineError, Result};
use crate::metrics::LoaderMetrics;

static YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})(?:[-/]\d{1,2}[-/]\d{1,2}(?:[T ].*)?)?$").expect("year pattern is valid")
});

/// Pick `;` when it occurs at least as often as `,` in the sample, otherwise `,`
pub fn sniff_delimiter(sample: &str) -> u8 {
    let semicolons = sample.matches(';').count();
    if semicolons > 0 && semicolons >= sample.matches(',').count() {
        b';'
    } else {
        b','
    }
}

/// Normalize a header cell: trimmed, lower-case, spaces to underscores, French accents folded
pub fn harmonize_column_name(name: &str) -> String {
    name.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .replace(' ', "_")
        .replace(['é', 'è', 'ê'], "e")
        .replace('à', "a")
        .replace('ô', "o")
        .replace('œ', "oe")
}

fn is_null(value: &str) -> bool {
    NULL_TOKENS.contains(&value)
}

/// Parse a count that may use a decimal comma; must be finite, non-negative and integral
pub(crate) fn parse_count(value: &str) -> Option<u64> {
    let number: f64 = value.trim().replace(',', ".").parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let rounded = number.round();
    if (number - rounded).abs() > 1e-6 || rounded > u64::MAX as f64 {
        return None;
    }
    Some(rounded as u64)
}

/// Accepts `2023` as well as a full date such as `2023-01-01`
pub(crate) fn parse_year(value: &str) -> Option<i32> {
    let caps = YEAR_RE.captures(value.trim())?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    (MIN_YEAR..=MAX_YEAR).contains(&year).then_some(year)
}

/// Column positions resolved from the harmonized header
struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    fn from_headers(headers: &ByteRecord, source_name: &str) -> Result<Self> {
        let positions: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, raw)| (harmonize_column_name(&String::from_utf8_lossy(raw)), i))
            .collect();

        if positions.is_empty() || positions.keys().all(|k| k.is_empty()) {
            return Err(PipelineError::EmptySource {
                source_name: source_name.to_string(),
            });
        }
        for column in REQUIRED_COLUMNS {
            if !positions.contains_key(column) {
                return Err(PipelineError::MissingColumn {
                    column: column.to_string(),
                    source_name: source_name.to_string(),
                });
            }
        }
        Ok(Self { positions })
    }

    /// Trimmed cell value, `None` for absent columns and null tokens
    fn get(&self, record: &ByteRecord, column: &str) -> Option<String> {
        let idx = *self.positions.get(column)?;
        let raw = record.get(idx)?;
        let value = String::from_utf8_lossy(raw).trim().to_string();
        if is_null(&value) {
            None
        } else {
            Some(value)
        }
    }
}

/// Load the raw CSV at `path` into an observation table
pub fn load<P: AsRef<Path>>(path: P) -> Result<ObservationTable> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    load_reader(file, &source_name)
}

/// Load CSV data from any reader.
///
/// Fails only on structural problems (no header, missing required column,
/// I/O); rows that fail coercion are excluded and counted in the load report.
#[instrument(skip(reader), fields(source = %source_name))]
pub fn load_reader<R: Read>(reader: R, source_name: &str) -> Result<ObservationTable> {
    let started = Instant::now();
    let mut reader = BufReader::with_capacity(SNIFF_BYTES.max(8 * 1024), reader);
    let sample = reader.fill_buf()?;
    let sample_len = sample.len().min(SNIFF_BYTES);
    let delimiter = sniff_delimiter(&String::from_utf8_lossy(&sample[..sample_len]));
    debug!("Detected delimiter {:?}", delimiter as char);

    let mut csv_reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(reader);

    let headers = csv_reader.byte_headers()?.clone();
    let columns = ColumnIndex::from_headers(&headers, source_name)?;

    let mut report = LoadReport {
        source_name: source_name.to_string(),
        delimiter: delimiter as char,
        ..LoadReport::default()
    };
    let mut rows = Vec::new();
    let mut record = ByteRecord::new();

    loop {
        match csv_reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                report.rows_read += 1;
                match coerce_record(&columns, &record, &mut report) {
                    Ok(observation) => rows.push(observation),
                    Err(reason) => report.exclude(reason),
                }
            }
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                report.rows_read += 1;
                debug!("Malformed record: {}", e);
                report.exclude(ExclusionReason::MalformedRecord);
            }
        }
    }

    report.rows_loaded = rows.len() as u64;
    let excluded = report.excluded_total();
    if excluded > 0 {
        warn!("Excluded {} of {} rows during coercion: {:?}", excluded, report.rows_read, report.excluded);
    }
    info!("Loaded {} rows from {}", report.rows_loaded, source_name);
    LoaderMetrics::record_load(&report, started.elapsed().as_secs_f64());

    Ok(ObservationTable {
        rows,
        taxonomy: PathologyTaxonomy::default(),
        diagnostics: Diagnostics {
            load: report,
            ..Diagnostics::default()
        },
    })
}

fn coerce_record(
    columns: &ColumnIndex,
    record: &ByteRecord,
    report: &mut LoadReport,
) -> std::result::Result<Observation, ExclusionReason> {
    let year = columns
        .get(record, COL_YEAR)
        .and_then(|v| parse_year(&v))
        .ok_or(ExclusionReason::BadYear)?;

    let department_code = columns.get(record, COL_DEPARTMENT).ok_or(ExclusionReason::MissingCode)?;
    let pathology_code = columns
        .get(record, COL_PATHOLOGY_CODE)
        .ok_or(ExclusionReason::MissingCode)?;
    let top_label = columns
        .get(record, COL_PATHOLOGY_LEVEL_1)
        .ok_or(ExclusionReason::MissingCode)?;
    let region_code = columns.get(record, COL_REGION).unwrap_or_default();

    let patient_count = columns
        .get(record, COL_PATIENT_COUNT)
        .and_then(|v| parse_count(&v))
        .ok_or(ExclusionReason::BadPatientCount)?;

    let population = match columns.get(record, COL_POPULATION) {
        None => None,
        Some(raw) => match parse_count(&raw) {
            Some(0) => {
                report.zero_population += 1;
                None
            }
            Some(n) => Some(n),
            None => return Err(ExclusionReason::BadPopulation),
        },
    };

    let mut pathology_path = vec![top_label];
    pathology_path.extend(columns.get(record, COL_PATHOLOGY_LEVEL_2));
    pathology_path.extend(columns.get(record, COL_PATHOLOGY_LEVEL_3));

    Ok(Observation {
        region_code,
        department_code,
        sex: Coded::Raw(columns.get(record, COL_SEX).unwrap_or_default()),
        age_band: Coded::Raw(columns.get(record, COL_AGE_BAND).unwrap_or_default()),
        year,
        pathology_code,
        pathology_level: PathologyLevel::from_depth(pathology_path.len()),
        pathology_path,
        patient_count,
        population,
        geo_resolved: false,
        prevalence_rate: None,
        low_confidence: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "annee;patho_niv1;patho_niv2;patho_niv3;top;cla_age_5;sexe;region;dept;Ntop;Npop";

    fn load_str(body: &str) -> Result<ObservationTable> {
        load_reader(body.as_bytes(), "test.csv")
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("a;b;c\n1;2,5;3"), b';');
        assert_eq!(sniff_delimiter("a,b,c\n1,2,3"), b',');
        assert_eq!(sniff_delimiter("single"), b',');
    }

    #[test]
    fn test_harmonize_column_name() {
        assert_eq!(harmonize_column_name(" Année "), "annee");
        assert_eq!(harmonize_column_name("Niveau prioritaire"), "niveau_prioritaire");
        assert_eq!(harmonize_column_name("\u{feff}Ntop"), "ntop");
    }

    #[test]
    fn test_parse_count_accepts_decimal_comma() {
        assert_eq!(parse_count("12,0"), Some(12));
        assert_eq!(parse_count("7"), Some(7));
        assert_eq!(parse_count("-1"), None);
        assert_eq!(parse_count("2.5"), None);
        assert_eq!(parse_count("abc"), None);
    }

    #[test]
    fn test_parse_year_accepts_dates() {
        assert_eq!(parse_year("2023"), Some(2023));
        assert_eq!(parse_year("2021-01-01"), Some(2021));
        assert_eq!(parse_year("1899"), None);
        assert_eq!(parse_year("20x3"), None);
    }

    #[test]
    fn test_missing_required_column_fails_with_name() {
        let body = "annee;patho_niv1;top;cla_age_5;sexe;region;dept;Ntop\n2022;Diabète;DIAB;00-04;1;11;75;40\n";
        match load_str(body) {
            Err(PipelineError::MissingColumn { column, .. }) => assert_eq!(column, "npop"),
            other => panic!("expected missing column error, got {:?}", other),
        }
    }

    #[test]
    fn test_codes_keep_leading_zeros_and_types_are_coerced() {
        let body = format!(
            "{}\n2022-01-01;Diabète;;;DIAB;00-04;1;01;01;40;12000,0\n",
            HEADER
        );
        let table = load_str(&body).unwrap();
        assert_eq!(table.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.year, 2022);
        assert_eq!(row.region_code, "01");
        assert_eq!(row.department_code, "01");
        assert_eq!(row.patient_count, 40);
        assert_eq!(row.population, Some(12000));
        assert_eq!(row.pathology_path, vec!["Diabète".to_string()]);
        assert_eq!(row.pathology_level, PathologyLevel::Top);
        assert_eq!(row.sex, Coded::Raw("1".to_string()));
        assert_eq!(table.diagnostics.load.delimiter, ';');
    }

    #[test]
    fn test_bad_rows_are_counted_not_raised() {
        let body = format!(
            "{}\n\
             2022;Diabète;;;DIAB;00-04;1;11;75;40;1000\n\
             abcd;Diabète;;;DIAB;00-04;1;11;75;40;1000\n\
             2022;Diabète;;;DIAB;00-04;1;11;75;-3;1000\n\
             2022;Diabète;;;DIAB;00-04;1;11;75;4;lots\n\
             2022;Diabète;;;;00-04;1;11;75;4;1000\n\
             2022;Diabète;;;DIAB;00-04;1;11;75;4;0\n\
             2022;Diabète;DIAB\n",
            HEADER
        );
        let table = load_str(&body).unwrap();
        let report = &table.diagnostics.load;
        assert_eq!(report.rows_read, 7);
        assert_eq!(report.rows_loaded, 2);
        assert_eq!(report.excluded[&ExclusionReason::BadYear], 1);
        assert_eq!(report.excluded[&ExclusionReason::BadPatientCount], 1);
        assert_eq!(report.excluded[&ExclusionReason::BadPopulation], 1);
        assert_eq!(report.excluded[&ExclusionReason::MissingCode], 1);
        assert_eq!(report.excluded[&ExclusionReason::MalformedRecord], 1);
        assert_eq!(report.zero_population, 1);
        assert_eq!(table.rows[1].population, None);
    }

    #[test]
    fn test_empty_source_is_schema_error() {
        let err = load_str("").unwrap_err();
        assert!(err.is_fatal());
    }
}
