//! Query argument payload forwarded to record sources.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record as returned by a source: a JSON object keyed by field name.
pub type Row = serde_json::Map<String, Value>;

/// Filter payload. Opaque to the cache; only the source interprets it.
pub type Filter = Value;

/// Bulk query arguments.
///
/// Everything here is forwarded verbatim to the source and also feeds the
/// cache key, so two queries differing in any field occupy different slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindManyArgs {
    /// Match condition.
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    /// Fields to keep in each returned row. `None` keeps all fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    /// Fields the source must return distinct combinations of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct: Option<Vec<String>>,
    /// Ordering, interpreted by the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Value>,
    /// Rows to skip before returning results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Maximum rows to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take: Option<usize>,
}

impl FindManyArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Keep only `fields` in each row.
    pub fn with_select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Ask the source for distinct values of `fields`.
    pub fn with_distinct<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distinct = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_order_by(mut self, order_by: Value) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_take(mut self, take: Option<usize>) -> Self {
        self.take = take;
        self
    }
}
