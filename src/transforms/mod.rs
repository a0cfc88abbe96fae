//! Built-in transformation functions.
//!
//! Pipelines declared in YAML reference transforms by name; code-built
//! pipelines may use these directly or supply their own closures. Every
//! built-in is row-local and therefore safe to run on partitions, except
//! `drop_duplicates`, which only removes duplicates within a partition.

pub mod sector;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::core::pipeline::{Params, TransformFn};
use crate::domain::Dataset;

pub use sector::{Sector, SectorProfile};

/// Names accepted by [`builtin`]
pub const BUILTIN_TRANSFORMS: &[&str] = &[
    "select_columns",
    "drop_columns",
    "rename_columns",
    "scale_column",
    "drop_duplicates",
    "filter_equals",
    "anonymize_pii",
    "calculate_risk_metrics",
    "hipaa_compliance",
];

/// Look up a built-in transform by name
pub fn builtin(name: &str) -> Option<TransformFn> {
    let function: TransformFn = match name {
        "select_columns" => Arc::new(select_columns),
        "drop_columns" => Arc::new(drop_columns),
        "rename_columns" => Arc::new(rename_columns),
        "scale_column" => Arc::new(scale_column),
        "drop_duplicates" => Arc::new(|data: Dataset, _: &Params| -> Result<Dataset> {
            Ok(data.drop_duplicates())
        }),
        "filter_equals" => Arc::new(filter_equals),
        "anonymize_pii" => Arc::new(sector::anonymize_pii),
        "calculate_risk_metrics" => Arc::new(sector::calculate_risk_metrics),
        "hipaa_compliance" => Arc::new(sector::hipaa_compliance),
        _ => return None,
    };
    Some(function)
}

/// `params.columns`: ordered list of columns to keep
pub fn select_columns(data: Dataset, params: &Params) -> Result<Dataset> {
    data.select_columns(&string_list(params, "columns")?)
}

/// `params.columns`: columns to remove
pub fn drop_columns(data: Dataset, params: &Params) -> Result<Dataset> {
    Ok(data.drop_columns(&string_list(params, "columns")?))
}

/// `params.mapping`: `{old: new}`
pub fn rename_columns(mut data: Dataset, params: &Params) -> Result<Dataset> {
    let mapping = params
        .get("mapping")
        .and_then(Value::as_object)
        .context("Parameter 'mapping' must be an object")?;

    for (from, to) in mapping {
        let to = to
            .as_str()
            .with_context(|| format!("New name for '{}' must be a string", from))?;
        data.rename_column(from, to)?;
    }
    Ok(data)
}

/// Multiply a numeric column by `params.factor`; nulls stay null
pub fn scale_column(mut data: Dataset, params: &Params) -> Result<Dataset> {
    let column = string_param(params, "column")?;
    let factor = params
        .get("factor")
        .and_then(Value::as_f64)
        .context("Parameter 'factor' must be a number")?;

    data.map_column(column, |value| match value {
        Value::Null => Ok(Value::Null),
        Value::Number(n) => Ok(scale_number(n, factor)),
        other => anyhow::bail!("Column '{}' holds non-numeric value {}", column, other),
    })?;
    Ok(data)
}

/// Keep integers integral when the factor is integral
fn scale_number(n: &serde_json::Number, factor: f64) -> Value {
    if factor.fract() == 0.0 {
        if let Some(scaled) = n.as_i64().and_then(|i| i.checked_mul(factor as i64)) {
            return Value::from(scaled);
        }
    }
    let scaled = n.as_f64().unwrap_or_default() * factor;
    serde_json::Number::from_f64(scaled).map_or(Value::Null, Value::Number)
}

/// `params.equals`: `{column: value}` rows must match
pub fn filter_equals(data: Dataset, params: &Params) -> Result<Dataset> {
    let filters = params
        .get("equals")
        .and_then(Value::as_object)
        .context("Parameter 'equals' must be an object")?;
    data.filter_eq(filters)
}

fn string_param<'a>(params: &'a Params, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("Parameter '{}' must be a string", key))
}

fn string_list(params: &Params, key: &str) -> Result<Vec<String>> {
    let items = params
        .get(key)
        .and_then(Value::as_array)
        .with_context(|| format!("Parameter '{}' must be a list of column names", key))?;

    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .with_context(|| format!("Parameter '{}' contains a non-string entry", key))
        })
        .collect()
}
