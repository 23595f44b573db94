//! Executor configuration.
//!
//! Settings are loaded from environment variables with defaults that match
//! the documented cache behavior:
//!
//! - `TAGCACHE_BASE_TAG`: tag shared by every cached query (default: `findManyCached`)
//! - `TAGCACHE_DEFAULT_TTL_SECS`: ttl when a strategy does not set one (default: 10)
//! - `TAGCACHE_DISTINCT_TTL_SECS`: ttl for distinct projections (default: 86400)
//! - `TAGCACHE_REFRESH_COALESCING`: `none` or `single-flight` (default: `none`)
//! - `TAGCACHE_REVALIDATION`: `eager` or `background` (default: `eager`)

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::strategy::{DEFAULT_DISTINCT_TTL_SECS, DEFAULT_TTL_SECS};
use crate::tags::DEFAULT_BASE_TAG;

// ============================================================================
// MODES
// ============================================================================

/// What happens when several callers see the same stale record at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshCoalescing {
    /// Every caller invalidates and refetches on its own.
    #[default]
    None,
    /// Callers refreshing the same key wait on one refresh and share it.
    ///
    /// Fresh hits are served without taking the per-key lock. Only callers
    /// that find the slot stale or empty queue on it, and each re-reads the
    /// slot once it gets the lock.
    SingleFlight,
}

impl FromStr for RefreshCoalescing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "single-flight" | "single_flight" | "singleflight" => Ok(Self::SingleFlight),
            other => Err(ConfigError::InvalidValue {
                field: "TAGCACHE_REFRESH_COALESCING".to_string(),
                value: other.to_string(),
                reason: "expected `none` or `single-flight`".to_string(),
            }),
        }
    }
}

/// How a stale record is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Revalidation {
    /// Invalidate and refetch before returning. Callers never see a record
    /// older than `ttl`.
    #[default]
    Eager,
    /// While the record is younger than `swr`, return it at once and refresh
    /// in a spawned task. Past `swr`, behave like `Eager`.
    ///
    /// The store is asked to keep records for `max(ttl, swr)` so that an
    /// expiring store still holds the stale record for the whole window.
    Background,
}

impl FromStr for Revalidation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(Self::Eager),
            "background" | "swr" => Ok(Self::Background),
            other => Err(ConfigError::InvalidValue {
                field: "TAGCACHE_REVALIDATION".to_string(),
                value: other.to_string(),
                reason: "expected `eager` or `background`".to_string(),
            }),
        }
    }
}

// ============================================================================
// CACHE SETTINGS
// ============================================================================

/// Executor-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Tag shared by every cached query. Invalidated on every stale read.
    pub base_tag: String,
    /// ttl applied to strategies that leave `ttl` unset.
    pub default_ttl_secs: u64,
    /// ttl used by distinct projections when the caller does not set one.
    pub distinct_ttl_secs: u64,
    /// Concurrent refresh policy.
    pub coalescing: RefreshCoalescing,
    /// Stale record replacement policy.
    pub revalidation: Revalidation,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            base_tag: DEFAULT_BASE_TAG.to_string(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            distinct_ttl_secs: DEFAULT_DISTINCT_TTL_SECS,
            coalescing: RefreshCoalescing::None,
            revalidation: Revalidation::Eager,
        }
    }
}

impl CacheSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from `TAGCACHE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(tag) = lookup("TAGCACHE_BASE_TAG") {
            let tag = tag.trim();
            if tag.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "TAGCACHE_BASE_TAG".to_string(),
                    value: String::new(),
                    reason: "must not be empty".to_string(),
                });
            }
            settings.base_tag = tag.to_string();
        }
        if let Some(raw) = lookup("TAGCACHE_DEFAULT_TTL_SECS") {
            settings.default_ttl_secs = parse_secs("TAGCACHE_DEFAULT_TTL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("TAGCACHE_DISTINCT_TTL_SECS") {
            settings.distinct_ttl_secs = parse_secs("TAGCACHE_DISTINCT_TTL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("TAGCACHE_REFRESH_COALESCING") {
            settings.coalescing = raw.parse()?;
        }
        if let Some(raw) = lookup("TAGCACHE_REVALIDATION") {
            settings.revalidation = raw.parse()?;
        }

        Ok(settings)
    }

    pub fn with_base_tag(mut self, tag: impl Into<String>) -> Self {
        self.base_tag = tag.into();
        self
    }

    pub fn with_default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl_secs = secs;
        self
    }

    pub fn with_distinct_ttl(mut self, secs: u64) -> Self {
        self.distinct_ttl_secs = secs;
        self
    }

    pub fn with_coalescing(mut self, coalescing: RefreshCoalescing) -> Self {
        self.coalescing = coalescing;
        self
    }

    pub fn with_revalidation(mut self, revalidation: Revalidation) -> Self {
        self.revalidation = revalidation;
        self
    }
}

fn parse_secs(field: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason: "must be a non-negative integer number of seconds".to_string(),
    })
}
