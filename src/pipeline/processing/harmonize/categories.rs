use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::domain::{AgeBand, Sex};
use crate::error::{PipelineError, Result};

/// Source spellings for each canonical sex value
const SEX_ALIASES: [(Sex, &[&str]); 3] = [
    (Sex::Male, &["1", "h", "m", "homme", "hommes", "male", "masculin"]),
    (Sex::Female, &["2", "f", "femme", "femmes", "female", "feminin", "féminin"]),
    (
        Sex::Both,
        &["9", "0", "3", "tous", "tous sexes", "ensemble", "both", "all"],
    ),
];

static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3})\s*-\s*(\d{1,3})(?:\s*ans)?$").expect("age range pattern is valid")
});

static OPEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3})\s*(?:\+|ans\s*\+|et\s*\+|(?:ans\s*)?et\s*plus)$").expect("open age pattern is valid")
});

fn normalize_token(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Explicit finite mapping tables from source spellings to canonical categories
#[derive(Debug, Clone)]
pub struct CategoryTables {
    sex: HashMap<String, Sex>,
}

impl CategoryTables {
    /// Build the tables and validate them
    pub fn new() -> Result<Self> {
        let mut sex = HashMap::new();
        for (canonical, aliases) in SEX_ALIASES {
            let own = canonical.as_str();
            for alias in aliases.iter().chain(std::iter::once(&own)) {
                let key = normalize_token(alias);
                if let Some(previous) = sex.insert(key.clone(), canonical) {
                    if previous != canonical {
                        return Err(PipelineError::Config(format!(
                            "sex alias `{}` maps to both {} and {}",
                            key, previous, canonical
                        )));
                    }
                }
            }
        }
        let tables = Self { sex };
        tables.validate()?;
        Ok(tables)
    }

    /// Every canonical value must be reachable and canonical labels must map to themselves
    pub fn validate(&self) -> Result<()> {
        for canonical in Sex::ALL {
            if self.map_sex(canonical.as_str()) != Some(canonical) {
                return Err(PipelineError::Config(format!(
                    "canonical sex `{}` does not map to itself",
                    canonical
                )));
            }
        }
        for band in AgeBand::all() {
            if self.map_age_band(&band.label()) != band {
                return Err(PipelineError::Config(format!(
                    "canonical age band `{}` does not map to itself",
                    band
                )));
            }
        }
        Ok(())
    }

    /// `None` for spellings outside the table
    pub fn map_sex(&self, raw: &str) -> Option<Sex> {
        self.sex.get(&normalize_token(raw)).copied()
    }

    /// Unrecognized labels land in `AgeBand::Unknown`
    pub fn map_age_band(&self, raw: &str) -> AgeBand {
        let token = normalize_token(raw);
        if let Some(caps) = RANGE_RE.captures(&token) {
            let lo: Option<u8> = caps[1].parse().ok();
            let hi: Option<u8> = caps[2].parse().ok();
            if let (Some(lo), Some(hi)) = (lo, hi) {
                if lo < AgeBand::OPEN_LOWER && hi == lo + AgeBand::WIDTH - 1 {
                    if let Some(band) = AgeBand::from_lower(lo) {
                        return band;
                    }
                }
            }
            return AgeBand::Unknown;
        }
        if let Some(caps) = OPEN_RE.captures(&token) {
            return match caps[1].parse::<u8>() {
                Ok(lower) if lower == AgeBand::OPEN_LOWER => AgeBand::Band(lower),
                _ => AgeBand::Unknown,
            };
        }
        AgeBand::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_validate() {
        assert!(CategoryTables::new().is_ok());
    }

    #[test]
    fn test_sex_codes_and_labels() {
        let tables = CategoryTables::new().unwrap();
        assert_eq!(tables.map_sex("1"), Some(Sex::Male));
        assert_eq!(tables.map_sex(" Femmes "), Some(Sex::Female));
        assert_eq!(tables.map_sex("9"), Some(Sex::Both));
        assert_eq!(tables.map_sex("tous sexes"), Some(Sex::Both));
        assert_eq!(tables.map_sex("x"), None);
        assert_eq!(tables.map_sex(""), None);
    }

    #[test]
    fn test_age_band_spellings() {
        let tables = CategoryTables::new().unwrap();
        assert_eq!(tables.map_age_band("00-04"), AgeBand::Band(0));
        assert_eq!(tables.map_age_band("5 - 9 ans"), AgeBand::Band(5));
        assert_eq!(tables.map_age_band("95et+"), AgeBand::Band(95));
        assert_eq!(tables.map_age_band("95 et plus"), AgeBand::Band(95));
        assert_eq!(tables.map_age_band("95+"), AgeBand::Band(95));
        assert_eq!(tables.map_age_band("tsage"), AgeBand::Unknown);
        assert_eq!(tables.map_age_band("5-14"), AgeBand::Unknown);
        assert_eq!(tables.map_age_band("85+"), AgeBand::Unknown);
        assert_eq!(tables.map_age_band("unknown"), AgeBand::Unknown);
    }
}
