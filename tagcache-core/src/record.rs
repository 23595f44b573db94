//! Cached records and the metadata envelope returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::strategy::CacheStrategy;

/// Whole seconds elapsed between `cached_at` and `now`, rounded up.
///
/// A record stamped in the future (clock skew between writers) counts as
/// zero seconds old.
pub fn stale_time_secs(cached_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let elapsed_ms = now.signed_duration_since(cached_at).num_milliseconds();
    if elapsed_ms <= 0 {
        0
    } else {
        // elapsed_ms > 0 so the cast cannot wrap
        (elapsed_ms as u64).div_ceil(1000)
    }
}

/// A stored query result together with the instant it was computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord<T> {
    /// The query result.
    pub result: T,
    /// When the result was fetched from the source.
    pub cached_at: DateTime<Utc>,
}

impl<T> CacheRecord<T> {
    /// Create a new record.
    pub fn new(result: T, cached_at: DateTime<Utc>) -> Self {
        Self { result, cached_at }
    }

    /// Age in whole seconds (rounded up) as of `now`.
    pub fn stale_time(&self, now: DateTime<Utc>) -> u64 {
        stale_time_secs(self.cached_at, now)
    }

    /// A record is stale once its age reaches the freshness window.
    ///
    /// With `ttl == 0` every record is stale.
    pub fn is_stale(&self, ttl: u64, now: DateTime<Utc>) -> bool {
        self.stale_time(now) >= ttl
    }

    /// Consume the record and return the result.
    pub fn into_result(self) -> T {
        self.result
    }

    /// Map the inner result to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRecord<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRecord {
            result: f(self.result),
            cached_at: self.cached_at,
        }
    }

    /// Map the inner result with a fallible conversion.
    pub fn try_map<U, E, F>(self, f: F) -> Result<CacheRecord<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        Ok(CacheRecord {
            result: f(self.result)?,
            cached_at: self.cached_at,
        })
    }
}

/// Result plus cache metadata, returned when the caller opts in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedResult<T> {
    /// The query result.
    pub result: T,
    /// Age of the record in whole seconds when it was returned.
    pub stale_time: u64,
    /// Freshness window the query ran with.
    pub ttl: u64,
    /// Stale-while-revalidate budget the query ran with.
    pub swr: u64,
    /// When the returned record was fetched from the source.
    pub cached_at: DateTime<Utc>,
    /// When this envelope was built.
    pub timestamp: DateTime<Utc>,
}

impl<T> ExpandedResult<T> {
    /// Build the envelope for `record` as seen at `now`.
    pub fn from_record(record: CacheRecord<T>, strategy: &CacheStrategy, now: DateTime<Utc>) -> Self {
        Self {
            stale_time: record.stale_time(now),
            ttl: strategy.effective_ttl(),
            swr: strategy.effective_swr(),
            cached_at: record.cached_at,
            timestamp: now,
            result: record.result,
        }
    }

    /// Consume the envelope and return the result.
    pub fn into_result(self) -> T {
        self.result
    }

    /// Returns true if the record was at least `ttl` seconds old when served.
    ///
    /// Only possible under background revalidation.
    pub fn served_stale(&self) -> bool {
        self.stale_time >= self.ttl
    }
}

/// Return shape of a cached query: the raw value, or the metadata envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryOutput<T> {
    Raw(T),
    Expanded(ExpandedResult<T>),
}

impl<T> QueryOutput<T> {
    /// The result, whichever shape was returned.
    pub fn into_result(self) -> T {
        match self {
            QueryOutput::Raw(result) => result,
            QueryOutput::Expanded(expanded) => expanded.result,
        }
    }

    /// Borrow the result, whichever shape was returned.
    pub fn result(&self) -> &T {
        match self {
            QueryOutput::Raw(result) => result,
            QueryOutput::Expanded(expanded) => &expanded.result,
        }
    }

    /// The envelope, if one was requested.
    pub fn expanded(&self) -> Option<&ExpandedResult<T>> {
        match self {
            QueryOutput::Raw(_) => None,
            QueryOutput::Expanded(expanded) => Some(expanded),
        }
    }

    /// Consume into the envelope, if one was requested.
    pub fn into_expanded(self) -> Option<ExpandedResult<T>> {
        match self {
            QueryOutput::Raw(_) => None,
            QueryOutput::Expanded(expanded) => Some(expanded),
        }
    }

    /// Map the inner result, keeping the shape and metadata.
    pub fn map<U, F>(self, f: F) -> QueryOutput<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            QueryOutput::Raw(result) => QueryOutput::Raw(f(result)),
            QueryOutput::Expanded(e) => QueryOutput::Expanded(ExpandedResult {
                result: f(e.result),
                stale_time: e.stale_time,
                ttl: e.ttl,
                swr: e.swr,
                cached_at: e.cached_at,
                timestamp: e.timestamp,
            }),
        }
    }
}
