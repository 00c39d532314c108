/// Column name constants for the published prevalence CSV
/// These are the names after header harmonization (lower-case, accents folded)

pub const COL_YEAR: &str = "annee";
pub const COL_REGION: &str = "region";
pub const COL_DEPARTMENT: &str = "dept";
pub const COL_SEX: &str = "sexe";
pub const COL_AGE_BAND: &str = "cla_age_5";
pub const COL_PATHOLOGY_CODE: &str = "top";
pub const COL_PATHOLOGY_LEVEL_1: &str = "patho_niv1";
pub const COL_PATHOLOGY_LEVEL_2: &str = "patho_niv2";
pub const COL_PATHOLOGY_LEVEL_3: &str = "patho_niv3";
pub const COL_PATIENT_COUNT: &str = "ntop";
pub const COL_POPULATION: &str = "npop";

/// Columns that must be present before any row is processed
pub const REQUIRED_COLUMNS: [&str; 9] = [
    COL_YEAR,
    COL_REGION,
    COL_DEPARTMENT,
    COL_SEX,
    COL_AGE_BAND,
    COL_PATHOLOGY_CODE,
    COL_PATHOLOGY_LEVEL_1,
    COL_PATIENT_COUNT,
    COL_POPULATION,
];

/// Cell values treated as missing
pub const NULL_TOKENS: [&str; 5] = ["", "NA", "NaN", "nan", "None"];

/// Bytes inspected when sniffing the delimiter
pub const SNIFF_BYTES: usize = 4096;

/// Accepted year window; anything outside is a coercion failure
pub const MIN_YEAR: i32 = 2000;
pub const MAX_YEAR: i32 = 2100;

/// Prevalence rates are expressed per this many inhabitants
pub const RATE_SCALE: f64 = 10_000.0;

/// Counts below this are flagged low-confidence (disclosure control)
pub const DEFAULT_SMALL_COUNT_THRESHOLD: u64 = 11;

/// Department code used by the source for national totals
pub const NATIONAL_TOTAL_DEPARTMENT: &str = "999";

/// Cache function names, part of every cache key
pub const FN_PREPARE: &str = "prepare";
pub const FN_GEO_AGGREGATE: &str = "geo_aggregate";
pub const FN_HIERARCHY_AGGREGATE: &str = "hierarchy_aggregate";
pub const FN_CORRELATION_MATRIX: &str = "correlation_matrix";
pub const FN_TOP_CATEGORIES: &str = "top_categories";
pub const FN_TIMESERIES: &str = "prevalence_timeseries";
pub const FN_SUMMARY: &str = "summary";
pub const FN_QUALITY_REPORT: &str = "quality_report";
