//! Distinct-value extraction over cached rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tagcache_core::Row;

/// Field(s) a distinct query projects onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DistinctFields {
    /// One field: the result is a flat list of its values.
    One(String),
    /// Several fields: the result is the projected rows.
    Many(Vec<String>),
}

impl DistinctFields {
    pub fn one(field: impl Into<String>) -> Self {
        Self::One(field.into())
    }

    pub fn many<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Many(fields.into_iter().map(Into::into).collect())
    }

    /// Field names in projection order.
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::One(field) => vec![field.clone()],
            Self::Many(fields) => fields.clone(),
        }
    }
}

impl From<&str> for DistinctFields {
    fn from(field: &str) -> Self {
        Self::One(field.to_string())
    }
}

impl From<String> for DistinctFields {
    fn from(field: String) -> Self {
        Self::One(field)
    }
}

impl From<Vec<String>> for DistinctFields {
    fn from(fields: Vec<String>) -> Self {
        Self::Many(fields)
    }
}

impl From<Vec<&str>> for DistinctFields {
    fn from(fields: Vec<&str>) -> Self {
        Self::many(fields)
    }
}

/// Options for a distinct query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistinctOptions {
    /// Row limit forwarded to the source.
    pub take: Option<usize>,
    /// Freshness window in seconds. `None` uses the configured distinct ttl.
    pub ttl: Option<u64>,
}

impl DistinctOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of a distinct query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DistinctOutput {
    /// Projected rows, for multi-field queries.
    Rows(Vec<Row>),
    /// Flattened truthy values, for single-field queries.
    Values(Vec<Value>),
}

impl DistinctOutput {
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            Self::Values(_) => None,
        }
    }

    pub fn values(&self) -> Option<&[Value]> {
        match self {
            Self::Values(values) => Some(values),
            Self::Rows(_) => None,
        }
    }

    pub fn into_values(self) -> Option<Vec<Value>> {
        match self {
            Self::Values(values) => Some(values),
            Self::Rows(_) => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Self::Rows(rows) => Some(rows),
            Self::Values(_) => None,
        }
    }
}

/// Returns true for `null`, `false`, `0`, and `""`.
///
/// Arrays and objects are truthy even when empty.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Pull `field` out of every row, flatten arrays one level, drop falsy values.
///
/// Order follows the rows. Duplicates are kept.
pub fn extract_values(field: &str, rows: Vec<Row>) -> Vec<Value> {
    let mut values = Vec::with_capacity(rows.len());
    for mut row in rows {
        match row.remove(field) {
            Some(Value::Array(items)) => values.extend(items),
            Some(value) => values.push(value),
            None => {}
        }
    }
    values.retain(|value| !is_falsy(value));
    values
}
