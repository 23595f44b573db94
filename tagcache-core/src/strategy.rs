//! Caller-supplied cache strategy.

use serde::{Deserialize, Serialize};

/// Default freshness window in seconds.
pub const DEFAULT_TTL_SECS: u64 = 10;

/// Padding added to `ttl` when `swr` is not given.
pub const DEFAULT_SWR_PADDING_SECS: u64 = 10;

/// How long distinct projections stay fresh unless told otherwise (one day).
pub const DEFAULT_DISTINCT_TTL_SECS: u64 = 86_400;

/// Per-query caching options.
///
/// `ttl` and `swr` are optional. An unset `ttl` is filled in by the executor
/// from its configured default (10 seconds unless overridden), and an unset
/// `swr` tracks `ttl`, so `with_ttl(30)` yields `swr = 40`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStrategy {
    /// Freshness window in seconds. Records at least this old are refreshed.
    pub ttl: Option<u64>,
    /// Stale-while-revalidate budget in seconds.
    pub swr: Option<u64>,
    /// Extra invalidation tag scoping this query.
    pub key: Option<String>,
    /// Return an [`ExpandedResult`](crate::ExpandedResult) instead of the raw value.
    pub expanded_output: bool,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self {
            ttl: None,
            swr: None,
            key: None,
            expanded_output: false,
        }
    }
}

impl CacheStrategy {
    /// Create a strategy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the freshness window.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the stale-while-revalidate budget explicitly.
    pub fn with_swr(mut self, swr: u64) -> Self {
        self.swr = Some(swr);
        self
    }

    /// Attach a caller-specific invalidation tag.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Request the metadata envelope.
    pub fn expanded(mut self) -> Self {
        self.expanded_output = true;
        self
    }

    /// Fill an unset `ttl` with `default_ttl`. An explicit `ttl` is kept.
    pub fn resolved(&self, default_ttl: u64) -> Self {
        Self {
            ttl: Some(self.ttl.unwrap_or(default_ttl)),
            ..self.clone()
        }
    }

    /// Effective `ttl`: the explicit value, or [`DEFAULT_TTL_SECS`].
    pub fn effective_ttl(&self) -> u64 {
        self.ttl.unwrap_or(DEFAULT_TTL_SECS)
    }

    /// Effective `swr`: the explicit value, or `ttl + 10`.
    pub fn effective_swr(&self) -> u64 {
        self.swr
            .unwrap_or_else(|| self.effective_ttl().saturating_add(DEFAULT_SWR_PADDING_SECS))
    }

    /// Freshness window as a `std::time::Duration`.
    pub fn ttl_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.effective_ttl())
    }
}
