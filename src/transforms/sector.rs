//! Sector profiles.
//!
//! A pipeline built for a known sector gets that sector's compliance steps
//! and validation rules in addition to its own. All of them tolerate
//! datasets that lack the columns they look at.

use std::fmt;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::pipeline::{Params, TransformationStep};
use crate::core::validation::{RuleOutcome, Severity, ValidationRule};
use crate::domain::Dataset;

/// Hex characters kept from a hashed customer id
const CUSTOMER_HASH_LEN: usize = 12;

const DEFAULT_NPL_STATUSES: &[&str] = &["default", "overdue"];

const PHI_COLUMNS: &[&str] = &["patient_name", "ssn", "address", "phone", "email"];

/// Upper bounds (inclusive) of the age buckets and their labels
const AGE_BUCKETS: &[(f64, &str)] = &[
    (18.0, "<18"),
    (30.0, "18-30"),
    (50.0, "30-50"),
    (70.0, "50-70"),
    (100.0, "70+"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sector {
    Banking,
    Healthcare,
}

impl Sector {
    /// Accepts English and French sector tags
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "banking" | "bank" | "banque" => Some(Self::Banking),
            "healthcare" | "health" | "sante" | "santé" => Some(Self::Healthcare),
            _ => None,
        }
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Banking => "banking",
            Self::Healthcare => "healthcare",
        })
    }
}

/// Steps and rules contributed by a sector
pub struct SectorProfile {
    sector: Sector,
    steps: Vec<TransformationStep>,
    rules: Vec<ValidationRule>,
}

impl SectorProfile {
    pub fn for_sector(tag: &str) -> Option<Self> {
        Sector::parse(tag).map(Self::new)
    }

    pub fn new(sector: Sector) -> Self {
        let (steps, rules) = match sector {
            Sector::Banking => (
                vec![
                    TransformationStep::new("anonymize_pii", anonymize_pii)
                        .with_order(1)
                        .sector_specific(),
                    TransformationStep::new("calculate_risk_metrics", calculate_risk_metrics)
                        .with_order(10)
                        .sector_specific(),
                ],
                vec![
                    ValidationRule::new("valid_account_numbers", Severity::Critical, valid_account_numbers),
                    ValidationRule::new("transaction_consistency", Severity::Major, transaction_consistency),
                ],
            ),
            Sector::Healthcare => (
                vec![TransformationStep::new("hipaa_compliance", hipaa_compliance)
                    .with_order(1)
                    .sector_specific()],
                vec![
                    ValidationRule::new("patient_id_format", Severity::Critical, patient_id_format),
                    ValidationRule::new("medical_code_validity", Severity::Major, medical_code_validity),
                ],
            ),
        };

        Self {
            sector,
            steps,
            rules,
        }
    }

    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn steps(&self) -> &[TransformationStep] {
        &self.steps
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    pub fn into_parts(self) -> (Vec<TransformationStep>, Vec<ValidationRule>) {
        (self.steps, self.rules)
    }
}

/// Plain-text rendering of a cell (strings unquoted)
fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn last_chars(text: &str, n: usize) -> &str {
    let start = text
        .char_indices()
        .rev()
        .nth(n - 1)
        .map_or(0, |(i, _)| i);
    &text[start..]
}

/// Mask account numbers to their last four characters and hash customer ids
pub fn anonymize_pii(mut data: Dataset, _params: &Params) -> Result<Dataset> {
    if data.has_column("account_number") {
        data.map_column("account_number", |value| {
            Ok(match value {
                Value::Null => Value::Null,
                other => Value::String(format!("****{}", last_chars(&cell_text(other), 4))),
            })
        })?;
    }

    if data.has_column("customer_id") {
        data.map_column("customer_id", |value| {
            Ok(match value {
                Value::Null => Value::Null,
                other => {
                    let digest = hex::encode(Sha256::digest(cell_text(other).as_bytes()));
                    Value::String(digest[..CUSTOMER_HASH_LEN].to_string())
                }
            })
        })?;
    }

    Ok(data)
}

/// Flag non-performing loans in `is_npl`.
///
/// `params.npl_statuses` overrides the statuses counted as non-performing.
pub fn calculate_risk_metrics(mut data: Dataset, params: &Params) -> Result<Dataset> {
    if !(data.has_column("loan_amount") && data.has_column("loan_status")) {
        return Ok(data);
    }

    let statuses: Vec<String> = match params.get("npl_statuses").and_then(Value::as_array) {
        Some(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        None => DEFAULT_NPL_STATUSES.iter().map(|s| s.to_string()).collect(),
    };
    let status_idx = data.column_index("loan_status").context("loan_status column vanished")?;

    data.set_column("is_npl", |_, row| {
        let npl = row[status_idx]
            .as_str()
            .is_some_and(|s| statuses.iter().any(|npl| npl == s));
        Value::Bool(npl)
    });
    Ok(data)
}

/// Drop direct identifiers and generalize `birth_date` into `age_group`.
///
/// `params.reference_date` (`YYYY-MM-DD`) fixes the date ages are computed
/// against; defaults to today.
pub fn hipaa_compliance(data: Dataset, params: &Params) -> Result<Dataset> {
    let phi: Vec<String> = PHI_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut data = data.drop_columns(&phi);

    if !data.has_column("birth_date") {
        return Ok(data);
    }

    let today = match params.get("reference_date").and_then(Value::as_str) {
        Some(text) => parse_date(text)?,
        None => Utc::now().date_naive(),
    };
    let birth_idx = data.column_index("birth_date").context("birth_date column vanished")?;

    let mut groups = Vec::with_capacity(data.row_count());
    for row in data.rows() {
        let group = match &row[birth_idx] {
            Value::Null => Value::Null,
            Value::String(text) => {
                let born = parse_date(text)?;
                let years = (today - born).num_days() as f64 / 365.0;
                age_group(years).map_or(Value::Null, |label| Value::String(label.to_string()))
            }
            other => anyhow::bail!("birth_date holds non-date value {}", other),
        };
        groups.push(group);
    }

    let mut groups = groups.into_iter();
    data.set_column("age_group", |_, _| groups.next().unwrap_or(Value::Null));
    Ok(data.drop_columns(&["birth_date".to_string()]))
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}'", text))
}

/// Right-inclusive buckets; ages outside (0, 100] have no group
fn age_group(years: f64) -> Option<&'static str> {
    if years <= 0.0 {
        return None;
    }
    AGE_BUCKETS
        .iter()
        .find(|(upper, _)| years <= *upper)
        .map(|(_, label)| *label)
}

/// Count non-null cells of `column` failing `valid`; absent column passes
fn check_column(
    data: &Dataset,
    column: &str,
    what: &str,
    mut valid: impl FnMut(&Value) -> bool,
) -> RuleOutcome {
    let Some(values) = data.column_values(column) else {
        return RuleOutcome::pass();
    };

    let invalid = values.filter(|v| !valid(v)).count();
    if invalid == 0 {
        RuleOutcome::pass()
    } else {
        RuleOutcome::fail(format!("{} invalid {}", invalid, what), invalid)
    }
}

/// Account numbers end in four digits (masked or not)
fn valid_account_numbers(data: &Dataset) -> Result<RuleOutcome> {
    Ok(check_column(data, "account_number", "account number(s)", |v| {
        v.is_null() || {
            let text = cell_text(v);
            text.chars().count() >= 4 && last_chars(&text, 4).chars().all(|c| c.is_ascii_digit())
        }
    }))
}

/// Transaction amounts are numeric
fn transaction_consistency(data: &Dataset) -> Result<RuleOutcome> {
    Ok(check_column(data, "amount", "transaction amount(s)", |v| {
        v.is_null() || v.is_number()
    }))
}

/// Patient ids are present and non-blank
fn patient_id_format(data: &Dataset) -> Result<RuleOutcome> {
    Ok(check_column(data, "patient_id", "patient id(s)", |v| match v {
        Value::String(s) => !s.trim().is_empty(),
        Value::Number(n) => n.is_u64() || n.is_i64(),
        _ => false,
    }))
}

/// Diagnosis codes look like ICD-10 (`A00`, `J45.9`, `S72.001`)
fn medical_code_validity(data: &Dataset) -> Result<RuleOutcome> {
    Ok(check_column(data, "diagnosis_code", "diagnosis code(s)", |v| {
        v.is_null() || v.as_str().is_some_and(is_icd10)
    }))
}

fn is_icd10(code: &str) -> bool {
    let (category, subcategory) = match code.split_once('.') {
        Some((category, sub)) => (category, Some(sub)),
        None => (code, None),
    };

    let mut chars = category.chars();
    let well_formed_category = category.len() == 3
        && chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_digit());

    well_formed_category
        && subcategory.map_or(true, |sub| {
            (1..=4).contains(&sub.len()) && sub.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(value: Value) -> Dataset {
        Dataset::from_json_array(value).unwrap()
    }

    #[test]
    fn test_parse_sector_tags() {
        assert_eq!(Sector::parse("banque"), Some(Sector::Banking));
        assert_eq!(Sector::parse("Banking"), Some(Sector::Banking));
        assert_eq!(Sector::parse("sante"), Some(Sector::Healthcare));
        assert_eq!(Sector::parse("retail"), None);
    }

    #[test]
    fn test_anonymize_pii() {
        let data = records(json!([
            {"account_number": "FR7612345678", "customer_id": 42},
            {"account_number": 987, "customer_id": null}
        ]));

        let out = anonymize_pii(data, &Params::new()).unwrap();

        assert_eq!(out.value(0, "account_number"), Some(&json!("****5678")));
        assert_eq!(out.value(1, "account_number"), Some(&json!("****987")));

        let expected = hex::encode(Sha256::digest(b"42"));
        assert_eq!(out.value(0, "customer_id"), Some(&json!(expected[..12])));
        assert_eq!(out.value(1, "customer_id"), Some(&Value::Null));
    }

    #[test]
    fn test_risk_metrics() {
        let data = records(json!([
            {"loan_amount": 100, "loan_status": "current"},
            {"loan_amount": 200, "loan_status": "overdue"},
            {"loan_amount": 300, "loan_status": "default"}
        ]));

        let out = calculate_risk_metrics(data.clone(), &Params::new()).unwrap();
        let flags: Vec<&Value> = out.column_values("is_npl").unwrap().collect();
        assert_eq!(flags, vec![&json!(false), &json!(true), &json!(true)]);

        let without_status = records(json!([{"loan_amount": 1}]));
        let out = calculate_risk_metrics(without_status, &Params::new()).unwrap();
        assert!(!out.has_column("is_npl"));
    }

    #[test]
    fn test_hipaa_compliance() {
        let data = records(json!([
            {"patient_id": "P1", "patient_name": "Jane", "ssn": "123", "birth_date": "2000-06-01"},
            {"patient_id": "P2", "patient_name": "John", "ssn": "456", "birth_date": "1950-01-01"},
            {"patient_id": "P3", "patient_name": "Baby", "ssn": "789", "birth_date": null}
        ]));
        let mut params = Params::new();
        params.insert("reference_date".into(), json!("2025-01-01"));

        let out = hipaa_compliance(data, &params).unwrap();

        assert_eq!(out.columns(), &["patient_id", "age_group"]);
        assert_eq!(out.value(0, "age_group"), Some(&json!("18-30")));
        assert_eq!(out.value(1, "age_group"), Some(&json!("70+")));
        assert_eq!(out.value(2, "age_group"), Some(&Value::Null));
    }

    #[test]
    fn test_age_buckets_right_inclusive() {
        assert_eq!(age_group(0.0), None);
        assert_eq!(age_group(18.0), Some("<18"));
        assert_eq!(age_group(18.1), Some("18-30"));
        assert_eq!(age_group(100.5), None);
    }

    #[test]
    fn test_banking_rules() {
        let good = records(json!([{"account_number": "****1234", "amount": 10.5}]));
        assert!(valid_account_numbers(&good).unwrap().passed);
        assert!(transaction_consistency(&good).unwrap().passed);

        let bad = records(json!([
            {"account_number": "12", "amount": "ten"},
            {"account_number": "ABCD", "amount": 3}
        ]));
        let outcome = valid_account_numbers(&bad).unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.affected_records, 2);
        assert_eq!(transaction_consistency(&bad).unwrap().affected_records, 1);

        let unrelated = records(json!([{"x": 1}]));
        assert!(valid_account_numbers(&unrelated).unwrap().passed);
    }

    #[test]
    fn test_healthcare_rules() {
        let data = records(json!([
            {"patient_id": "P1", "diagnosis_code": "J45.9"},
            {"patient_id": "", "diagnosis_code": "A00"},
            {"patient_id": null, "diagnosis_code": "45X"}
        ]));

        assert_eq!(patient_id_format(&data).unwrap().affected_records, 2);
        assert_eq!(medical_code_validity(&data).unwrap().affected_records, 1);
        assert!(is_icd10("S72.001"));
        assert!(!is_icd10("S72."));
    }
}
