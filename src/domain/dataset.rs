//! In-memory tabular dataset passed between pipeline phases.
//!
//! A dataset is an ordered list of column names plus ordered rows of JSON
//! values. Row order is significant everywhere: concatenation, partitioning
//! and merging all preserve it.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single row; cells line up with [`Dataset::columns`]
pub type Row = Vec<Value>;

static NULL: Value = Value::Null;

/// Tabular collection of rows with named columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataset")]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Unchecked wire form; every row must match the column count
#[derive(Deserialize)]
struct RawDataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl TryFrom<RawDataset> for Dataset {
    type Error = anyhow::Error;

    fn try_from(raw: RawDataset) -> Result<Self> {
        if let Some((index, row)) = raw
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != raw.columns.len())
        {
            anyhow::bail!(
                "Row {} has {} values but dataset has {} columns",
                index,
                row.len(),
                raw.columns.len()
            );
        }

        Ok(Self {
            columns: raw.columns,
            rows: raw.rows,
        })
    }
}

impl Dataset {
    /// Create an empty dataset with the given columns
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Create a dataset from columns and rows.
    ///
    /// Short rows are padded with nulls, long rows are rejected.
    pub fn from_rows<I, S>(columns: I, rows: Vec<Row>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dataset = Self::new(columns);
        for row in rows {
            dataset.push_row(row)?;
        }
        Ok(dataset)
    }

    /// Build a dataset from JSON objects.
    ///
    /// Columns are the union of all keys in first-seen order.
    pub fn from_records(records: Vec<Map<String, Value>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|c| record.remove(c).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Parse a JSON array of objects
    pub fn from_json_array(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => anyhow::bail!("Expected a JSON array of objects, got {}", json_kind(&other)),
        };

        let records = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map),
                other => anyhow::bail!("Record {} is {}, expected an object", i, json_kind(&other)),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_records(records))
    }

    /// Convert rows back into JSON objects
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Value of one cell
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Iterate over all values of a column
    pub fn column_values<'a>(&'a self, column: &str) -> Option<impl Iterator<Item = &'a Value>> {
        let idx = self.column_index(column)?;
        Some(
            self.rows
                .iter()
                .map(move |row| row.get(idx).unwrap_or(&NULL)),
        )
    }

    /// Append a row, padding missing trailing cells with nulls
    pub fn push_row(&mut self, mut row: Row) -> Result<()> {
        if row.len() > self.columns.len() {
            anyhow::bail!(
                "Row has {} values but dataset has {} columns",
                row.len(),
                self.columns.len()
            );
        }
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
        Ok(())
    }

    /// Concatenate datasets in iteration order.
    ///
    /// Columns are unioned in first-seen order and cells missing from a part
    /// are filled with nulls.
    pub fn concat<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Dataset>,
    {
        let parts: Vec<Dataset> = parts.into_iter().collect();

        let mut columns: Vec<String> = Vec::new();
        for part in &parts {
            for column in &part.columns {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }

        let total = parts.iter().map(Dataset::row_count).sum();
        let mut rows = Vec::with_capacity(total);

        for part in parts {
            if part.columns == columns {
                rows.extend(part.rows);
                continue;
            }

            let mapping: Vec<Option<usize>> =
                columns.iter().map(|c| part.column_index(c)).collect();
            for row in part.rows {
                rows.push(
                    mapping
                        .iter()
                        .map(|idx| idx.and_then(|i| row.get(i).cloned()).unwrap_or(Value::Null))
                        .collect(),
                );
            }
        }

        Self { columns, rows }
    }

    /// Split into exactly `n` contiguous, order-preserving partitions.
    ///
    /// Sizes differ by at most one; the first `len % n` partitions carry the
    /// extra row. Partitions may be empty when `n > len`.
    pub fn split(self, n: usize) -> Vec<Dataset> {
        let n = n.max(1);
        let len = self.rows.len();
        let base = len / n;
        let extra = len % n;

        let mut partitions = Vec::with_capacity(n);
        let mut rows = self.rows.into_iter();
        for i in 0..n {
            let size = base + usize::from(i < extra);
            partitions.push(Dataset {
                columns: self.columns.clone(),
                rows: rows.by_ref().take(size).collect(),
            });
        }
        partitions
    }

    /// Number of rows identical to an earlier row
    pub fn duplicate_count(&self) -> usize {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows
            .iter()
            .filter(|row| !seen.insert(serde_json::to_string(row).unwrap_or_default()))
            .count()
    }

    /// Drop rows identical to an earlier row, keeping first occurrences
    pub fn drop_duplicates(mut self) -> Self {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows
            .retain(|row| seen.insert(serde_json::to_string(row).unwrap_or_default()));
        self
    }

    /// Keep only rows matching a predicate
    pub fn retain_rows<F>(mut self, mut keep: F) -> Self
    where
        F: FnMut(&[String], &Row) -> bool,
    {
        let columns = &self.columns;
        self.rows.retain(|row| keep(columns, row));
        self
    }

    /// Keep rows whose cells equal every `column -> value` pair of the filter
    pub fn filter_eq(self, filters: &Map<String, Value>) -> Result<Self> {
        let mut predicates = Vec::with_capacity(filters.len());
        for (column, expected) in filters {
            let idx = self
                .column_index(column)
                .with_context(|| format!("Filter column '{}' not present", column))?;
            predicates.push((idx, expected.clone()));
        }

        Ok(self.retain_rows(|_, row| predicates.iter().all(|(idx, v)| &row[*idx] == v)))
    }

    /// Rewrite every value of one column
    pub fn map_column<F>(&mut self, column: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&Value) -> Result<Value>,
    {
        let idx = self
            .column_index(column)
            .with_context(|| format!("Column '{}' not present", column))?;
        for row in &mut self.rows {
            row[idx] = f(&row[idx])?;
        }
        Ok(())
    }

    /// Add (or replace) a column computed from each row
    pub fn set_column<F>(&mut self, column: &str, mut f: F)
    where
        F: FnMut(&[String], &Row) -> Value,
    {
        let idx = match self.column_index(column) {
            Some(idx) => idx,
            None => {
                self.columns.push(column.to_string());
                for row in &mut self.rows {
                    row.push(Value::Null);
                }
                self.columns.len() - 1
            }
        };

        let columns = self.columns.clone();
        for row in &mut self.rows {
            row[idx] = f(&columns, row);
        }
    }

    /// Remove columns by name; unknown names are ignored
    pub fn drop_columns(mut self, names: &[String]) -> Self {
        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|&i| !names.contains(&self.columns[i]))
            .collect();
        self.project(&keep);
        self
    }

    /// Keep only the named columns, in the given order
    pub fn select_columns(mut self, names: &[String]) -> Result<Self> {
        let keep = names
            .iter()
            .map(|n| {
                self.column_index(n)
                    .with_context(|| format!("Column '{}' not present", n))
            })
            .collect::<Result<Vec<_>>>()?;
        self.project(&keep);
        Ok(self)
    }

    /// Reorder to exactly `names`, adding absent columns as nulls
    pub fn conform_to(self, names: &[String]) -> Self {
        let target = Dataset::new(names.iter().cloned());
        let mut merged = Dataset::concat([target, self]);
        merged.columns.truncate(names.len());
        for row in &mut merged.rows {
            row.truncate(names.len());
        }
        merged
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        let idx = self
            .column_index(from)
            .with_context(|| format!("Column '{}' not present", from))?;
        if self.has_column(to) {
            anyhow::bail!("Column '{}' already exists", to);
        }
        self.columns[idx] = to.to_string();
        Ok(())
    }

    fn project(&mut self, keep: &[usize]) {
        self.columns = keep.iter().map(|&i| self.columns[i].clone()).collect();
        for row in &mut self.rows {
            *row = keep.iter().map(|&i| row[i].clone()).collect();
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
