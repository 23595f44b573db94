//! Error types for tagcache operations

use thiserror::Error;

/// Errors raised by a record source while answering a query.
///
/// The cache never produces these itself. A source returns them and the
/// executor hands them back to the caller unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed for model {model}: {reason}")]
    Failed { model: String, reason: String },

    #[error("Record source unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to serialize cached result: {reason}")]
    Serialization { reason: String },

    #[error("Failed to deserialize cached result: {reason}")]
    Deserialization { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all tagcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Shorthand for a failed fetch against `model`.
    pub fn fetch_failed(model: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::Fetch(FetchError::Failed {
            model: model.into(),
            reason: reason.into(),
        })
    }

    /// Returns true if this error originated in a record source.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, CacheError::Fetch(_))
    }
}

/// Result type alias for tagcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
