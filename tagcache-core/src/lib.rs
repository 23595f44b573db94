//! tagcache Core - Data Types
//!
//! Pure data structures shared by the store and the query executor:
//! cache strategies, records, the expanded metadata envelope, tag sets and
//! cache keys, query arguments, the clock abstraction, configuration, and
//! the error taxonomy.

pub mod args;
pub mod clock;
pub mod config;
pub mod error;
pub mod record;
pub mod strategy;
pub mod tags;

pub use args::{Filter, FindManyArgs, Row};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheSettings, RefreshCoalescing, Revalidation};
pub use error::{CacheError, CacheResult, ConfigError, FetchError, StoreError};
pub use record::{stale_time_secs, CacheRecord, ExpandedResult, QueryOutput};
pub use strategy::{
    CacheStrategy, DEFAULT_DISTINCT_TTL_SECS, DEFAULT_SWR_PADDING_SECS, DEFAULT_TTL_SECS,
};
pub use tags::{distinct_key, model_tag, CacheKey, TagSet, DEFAULT_BASE_TAG};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
