use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

use crate::constants::SNIFF_BYTES;
use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::loader::{harmonize_column_name, sniff_delimiter};

const DEPT_CODE_COLUMNS: [&str; 4] = ["dept_code", "dep", "code_departement", "dept"];
const DEPT_NAME_COLUMNS: [&str; 4] = ["dept_name", "nom_departement", "libelle", "nom"];
const REGION_CODE_COLUMNS: [&str; 4] = ["region_code", "reg", "code_region", "region"];
const REGION_NAME_COLUMNS: [&str; 3] = ["region_name", "nom_region", "libelle_region"];

/// GeoJSON properties that commonly carry the department or region code
const FEATURE_ID_PROPERTIES: [&str; 14] = [
    "code",
    "id",
    "code_insee",
    "code_dept",
    "code_departement",
    "dep",
    "departement",
    "INSEE_DEP",
    "INSEE_DEP_CODE",
    "code_reg",
    "code_region",
    "insee_reg",
    "INSEE_REG",
    "REGION",
];

const FEATURE_NAME_PROPERTIES: [&str; 9] = [
    "nom", "name", "libelle", "nom_dep", "nom_reg", "departement", "region", "DEP_NAME", "REG_NAME",
];

/// Department codes: `2A`/`2B` kept, overseas codes 970..=989 padded to three digits, others to two
pub fn normalize_department_code(raw: &str) -> String {
    let code = raw.trim().to_uppercase();
    if code == "2A" || code == "2B" {
        return code;
    }
    let digits: String = code.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return code;
    }
    match digits.parse::<u32>() {
        Ok(n) if (970..=989).contains(&n) => format!("{:03}", n),
        Ok(n) => format!("{:02}", n),
        Err(_) => code,
    }
}

/// Region codes are two-digit strings (`1` and `1.0` both become `01`)
pub fn normalize_region_code(raw: &str) -> String {
    let code = raw.trim();
    if code.is_empty() {
        return String::new();
    }
    if let Ok(n) = code.parse::<u32>() {
        return format!("{:02}", n);
    }
    match code.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 => format!("{:02}", n as u32),
        _ => code.to_string(),
    }
}

/// A department and the region it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub code: String,
    pub name: String,
    pub region_code: String,
}

/// A code with its display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoUnit {
    pub code: String,
    pub name: String,
}

/// Boundary geometry for map rendering, kept as the raw GeoJSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryLayer {
    pub geojson: serde_json::Value,
    /// Feature property holding the code, e.g. `properties.code`
    pub feature_id_key: String,
    /// Feature property holding the display name, when one was found
    pub name_property: Option<String>,
}

impl BoundaryLayer {
    pub fn from_value(geojson: serde_json::Value) -> Self {
        let feature_id_key = detect_feature_id_key(&geojson);
        let name_property = guess_name_property(&geojson);
        Self {
            geojson,
            feature_id_key,
            name_property,
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        Ok(Self::from_value(value))
    }

    /// Codes of every feature, read from the detected id property
    pub fn feature_codes(&self) -> Vec<String> {
        let property = self.feature_id_key.trim_start_matches("properties.");
        features(&self.geojson)
            .iter()
            .filter_map(|f| f.get("properties")?.get(property))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

fn features(geojson: &serde_json::Value) -> &[serde_json::Value] {
    geojson
        .get("features")
        .and_then(|f| f.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[])
}

fn first_properties(geojson: &serde_json::Value) -> Option<&serde_json::Map<String, serde_json::Value>> {
    features(geojson).first()?.get("properties")?.as_object()
}

fn detect_feature_id_key(geojson: &serde_json::Value) -> String {
    let Some(props) = first_properties(geojson) else {
        return String::new();
    };
    FEATURE_ID_PROPERTIES
        .iter()
        .find(|k| props.contains_key(**k))
        .map(|k| format!("properties.{}", k))
        .unwrap_or_else(|| "properties.code".to_string())
}

fn guess_name_property(geojson: &serde_json::Value) -> Option<String> {
    let props = first_properties(geojson)?;
    FEATURE_NAME_PROPERTIES
        .iter()
        .find(|k| props.contains_key(**k))
        .map(|k| k.to_string())
}

/// Department → region mapping with display names and optional boundaries.
/// Built once and shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoReference {
    departments: BTreeMap<String, Department>,
    regions: BTreeMap<String, String>,
    pub department_boundaries: Option<BoundaryLayer>,
    pub region_boundaries: Option<BoundaryLayer>,
}

impl GeoReference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a department; codes are normalized on the way in
    pub fn with_department(mut self, code: &str, name: &str, region_code: &str, region_name: &str) -> Self {
        self.insert(code, name, region_code, Some(region_name));
        self
    }

    pub fn with_department_boundaries(mut self, layer: BoundaryLayer) -> Self {
        self.department_boundaries = Some(layer);
        self
    }

    pub fn with_region_boundaries(mut self, layer: BoundaryLayer) -> Self {
        self.region_boundaries = Some(layer);
        self
    }

    fn insert(&mut self, code: &str, name: &str, region_code: &str, region_name: Option<&str>) {
        let code = normalize_department_code(code);
        let region_code = normalize_region_code(region_code);
        if let Some(region_name) = region_name.filter(|n| !n.trim().is_empty()) {
            self.regions.insert(region_code.clone(), region_name.trim().to_string());
        } else {
            self.regions.entry(region_code.clone()).or_insert_with(|| region_code.clone());
        }
        self.departments.insert(
            code.clone(),
            Department {
                code,
                name: name.trim().to_string(),
                region_code,
            },
        );
    }

    /// Load the mapping from a CSV with department code/name and region code/name columns
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        Self::from_reader(File::open(path)?, &name)
    }

    pub fn from_reader<R: Read>(reader: R, source_name: &str) -> Result<Self> {
        let mut reader = BufReader::with_capacity(SNIFF_BYTES.max(8 * 1024), reader);
        let sample = reader.fill_buf()?;
        let sample_len = sample.len().min(SNIFF_BYTES);
        let delimiter = sniff_delimiter(&String::from_utf8_lossy(&sample[..sample_len]));
        let mut csv_reader = ReaderBuilder::new().delimiter(delimiter).from_reader(reader);

        let headers: HashMap<String, usize> = csv_reader
            .headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| (harmonize_column_name(h), i))
            .collect();
        let find = |candidates: &[&str]| candidates.iter().find_map(|c| headers.get(*c).copied());
        let missing = |column: &str| PipelineError::MissingColumn {
            column: column.to_string(),
            source_name: source_name.to_string(),
        };
        let dept_idx = find(&DEPT_CODE_COLUMNS[..]).ok_or_else(|| missing(DEPT_CODE_COLUMNS[0]))?;
        let dept_name_idx = find(&DEPT_NAME_COLUMNS[..]).ok_or_else(|| missing(DEPT_NAME_COLUMNS[0]))?;
        let region_idx = find(&REGION_CODE_COLUMNS[..]).ok_or_else(|| missing(REGION_CODE_COLUMNS[0]))?;
        let region_name_idx = find(&REGION_NAME_COLUMNS[..]);

        let mut reference = Self::new();
        let mut skipped = 0u64;
        for record in csv_reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            let code = record.get(dept_idx).unwrap_or("").trim();
            let region = record.get(region_idx).unwrap_or("").trim();
            if code.is_empty() || region.is_empty() {
                skipped += 1;
                continue;
            }
            let name = record.get(dept_name_idx).unwrap_or(code);
            let region_name = region_name_idx.and_then(|i| record.get(i));
            reference.insert(code, name, region, region_name);
        }
        if skipped > 0 {
            warn!("Skipped {} unusable rows in geographic reference {}", skipped, source_name);
        }
        info!(
            "Loaded geographic reference: {} departments in {} regions",
            reference.departments.len(),
            reference.regions.len()
        );
        Ok(reference)
    }

    /// Look up a department by (already normalized) code
    pub fn department(&self, code: &str) -> Option<&Department> {
        self.departments.get(code)
    }

    pub fn departments(&self) -> impl Iterator<Item = &Department> {
        self.departments.values()
    }

    pub fn regions(&self) -> impl Iterator<Item = GeoUnit> + '_ {
        self.regions.iter().map(|(code, name)| GeoUnit {
            code: code.clone(),
            name: name.clone(),
        })
    }

    pub fn region_name(&self, code: &str) -> Option<&str> {
        self.regions.get(code).map(|s| s.as_str())
    }

    pub fn department_name(&self, code: &str) -> Option<&str> {
        self.departments.get(code).map(|d| d.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.departments.is_empty()
    }

    /// Hex SHA-256 of the department and region mapping; boundaries are not part of it
    pub fn digest(&self) -> Result<String> {
        let body = serde_json::to_vec(&(&self.departments, &self.regions))?;
        Ok(hex::encode(Sha256::digest(&body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_department_code() {
        assert_eq!(normalize_department_code("1"), "01");
        assert_eq!(normalize_department_code("099"), "99");
        assert_eq!(normalize_department_code(" 2a "), "2A");
        assert_eq!(normalize_department_code("974"), "974");
        assert_eq!(normalize_department_code("999"), "999");
        assert_eq!(normalize_department_code("75"), "75");
        assert_eq!(normalize_department_code(&normalize_department_code("6")), "06");
    }

    #[test]
    fn test_normalize_region_code() {
        assert_eq!(normalize_region_code("1"), "01");
        assert_eq!(normalize_region_code("11.0"), "11");
        assert_eq!(normalize_region_code("84"), "84");
        assert_eq!(normalize_region_code(""), "");
        assert_eq!(normalize_region_code("COM"), "COM");
    }

    #[test]
    fn test_reference_from_csv_with_insee_headers() {
        let body = "DEP;REG;LIBELLE\n01;84;Ain\n2A;94;Corse-du-Sud\n;11;Orphan\n";
        let reference = GeoReference::from_reader(body.as_bytes(), "departements.csv").unwrap();
        let ain = reference.department("01").unwrap();
        assert_eq!(ain.region_code, "84");
        assert_eq!(ain.name, "Ain");
        assert!(reference.department("2A").is_some());
        assert_eq!(reference.departments().count(), 2);
        assert_eq!(reference.region_name("84"), Some("84"));
    }

    #[test]
    fn test_reference_missing_column() {
        let body = "code;label\n01;Ain\n";
        let err = GeoReference::from_reader(body.as_bytes(), "bad.csv").unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { .. }));
    }

    #[test]
    fn test_boundary_layer_detects_keys() {
        let layer = BoundaryLayer::from_value(json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"code": "01", "nom": "Ain"}, "geometry": null},
                {"type": "Feature", "properties": {"code": "02", "nom": "Aisne"}, "geometry": null}
            ]
        }));
        assert_eq!(layer.feature_id_key, "properties.code");
        assert_eq!(layer.name_property.as_deref(), Some("nom"));
        assert_eq!(layer.feature_codes(), vec!["01".to_string(), "02".to_string()]);
    }

    #[test]
    fn test_digest_follows_the_mapping() {
        let a = GeoReference::new().with_department("75", "Paris", "11", "Île-de-France");
        let same = GeoReference::new().with_department("75", "Paris", "11", "Île-de-France");
        let moved = GeoReference::new().with_department("75", "Paris", "84", "Auvergne-Rhône-Alpes");
        assert_eq!(a.digest().unwrap(), same.digest().unwrap());
        assert_ne!(a.digest().unwrap(), moved.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
    }
}
