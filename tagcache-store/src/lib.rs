//! tagcache Store - Tag-Indexed Cache Store
//!
//! Defines the keyed store the executor reads through, plus an in-memory
//! implementation. A store maps a [`CacheKey`](tagcache_core::CacheKey)
//! (tags + argument digest) to a [`CacheRecord`](tagcache_core::CacheRecord)
//! and supports two operations:
//!
//! - compute-if-absent-or-expired, driven by a revalidation period
//! - invalidation of every record carrying a tag
//!
//! The store is shared mutable state. It is always injected into the
//! executor (`Arc<S>`), never reached through a global.

pub mod memory;
pub mod traits;

pub use memory::{ExpiryPolicy, InMemoryTagStore};
pub use traits::{CacheStats, PopulateFuture, TagStore};
