use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// A cleaned tax identifier: digits only, 10 or 12 long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaxId(String);

impl TaxId {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let cleaned = clean(raw);
        if cleaned.is_empty() {
            return Err(AppError::InvalidIdentifier("empty identifier".into()));
        }
        if !cleaned.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::InvalidIdentifier(format!(
                "{raw}: only digits are allowed"
            )));
        }
        if cleaned.len() != 10 && cleaned.len() != 12 {
            return Err(AppError::InvalidIdentifier(format!(
                "{raw}: expected 10 or 12 digits, got {}",
                cleaned.len()
            )));
        }
        Ok(Self(cleaned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Russian INN: 10 digits for companies, 12 for individuals.
    pub fn is_inn(&self) -> bool {
        validate_inn(&self.0)
    }

    /// Kazakh BIN: always 12 digits.
    pub fn is_bin(&self) -> bool {
        validate_bin(&self.0)
    }
}

impl std::fmt::Display for TaxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn clean(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

pub fn validate_inn(raw: &str) -> bool {
    let cleaned = clean(raw);
    (cleaned.len() == 10 || cleaned.len() == 12) && cleaned.chars().all(|c| c.is_ascii_digit())
}

pub fn validate_bin(raw: &str) -> bool {
    let cleaned = clean(raw);
    cleaned.len() == 12 && cleaned.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Country {
    Ru,
    Kz,
    Unknown,
}

pub fn detect_country(inn: Option<&str>, bin: Option<&str>) -> Country {
    if bin.map(validate_bin).unwrap_or(false) {
        return Country::Kz;
    }
    if inn.map(validate_inn).unwrap_or(false) {
        return Country::Ru;
    }
    Country::Unknown
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kpp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ogrn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub okpo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legal_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub director: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub director_position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub okved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liquidation_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capital: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue: Option<f64>,
}

/// Outcome of one attempt against one source. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub confidence: f64,
    #[serde(flatten)]
    pub fields: ResolvedFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
}

impl EnrichmentResult {
    pub fn success(source: impl Into<String>, fields: ResolvedFields, confidence: f64) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            success: true,
            error: None,
            confidence: confidence.clamp(0.0, 1.0),
            fields,
            raw_payload: None,
        }
    }

    pub fn failure(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            success: false,
            error: Some(error.into()),
            confidence: 0.0,
            fields: ResolvedFields::default(),
            raw_payload: None,
        }
    }

    pub fn with_raw_payload(mut self, raw: impl Into<String>) -> Self {
        self.raw_payload = Some(raw.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentResponse {
    pub success: bool,
    pub results: Vec<EnrichmentResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Adds `weight` for every resolved field; used by each adapter with its own
/// calibration table.
pub(crate) fn weighted_confidence(checks: &[(bool, f64)]) -> f64 {
    let total: f64 = checks
        .iter()
        .filter(|(present, _)| *present)
        .map(|(_, weight)| weight)
        .sum();
    total.clamp(0.0, 1.0)
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_cleans_identifiers() {
        let id = TaxId::parse("77-07 083 893").unwrap();
        assert_eq!(id.as_str(), "7707083893");
        assert!(id.is_inn());
        assert!(!id.is_bin());

        let bin = TaxId::parse("123456789012").unwrap();
        assert!(bin.is_inn());
        assert!(bin.is_bin());
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!(matches!(
            TaxId::parse("12345"),
            Err(AppError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            TaxId::parse("12345abcde"),
            Err(AppError::InvalidIdentifier(_))
        ));
        assert!(TaxId::parse("   ").is_err());
    }

    #[test]
    fn detects_country_preferring_bin() {
        assert_eq!(
            detect_country(Some("7707083893"), Some("123456789012")),
            Country::Kz
        );
        assert_eq!(detect_country(Some("7707083893"), None), Country::Ru);
        assert_eq!(detect_country(Some("12"), Some("34")), Country::Unknown);
    }

    #[test]
    fn failed_results_serialize_without_fields() {
        let result = EnrichmentResult::failure("gisp", "timeout");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "timeout");
        assert!(json.get("full_name").is_none());
    }

    #[test]
    fn confidence_sums_present_weights() {
        let value = weighted_confidence(&[(true, 0.3), (false, 0.2), (true, 0.15)]);
        assert!((value - 0.45).abs() < 1e-9);
    }
}
