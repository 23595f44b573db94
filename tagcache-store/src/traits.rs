//! Tag-indexed store trait and statistics.
//!
//! This module defines the contract the executor relies on. Any keyed store
//! that can compute-if-absent-or-expired and drop every entry carrying a tag
//! can sit behind the executor (in-memory, Redis, a framework data cache).

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;
use tagcache_core::{CacheKey, CacheRecord, CacheResult};

/// Deferred computation of a missing slot. Only polled on a miss.
pub type PopulateFuture<'a> = BoxFuture<'a, CacheResult<Value>>;

/// Shared, process-wide keyed store addressed by [`CacheKey`].
///
/// # Contract
///
/// - `get_or_populate` returns the record at `key` if it exists and is
///   younger than `revalidate`; otherwise it awaits `populate`, stamps the
///   value with the current time, stores it under every tag of `key`, and
///   returns it.
/// - If `populate` fails, the error is returned unchanged and nothing is
///   stored.
/// - `invalidate_tag` removes every record whose key carries `tag`, across
///   all callers. Invalidating a widely shared tag clears more than the
///   caller's own query.
/// - No serialisation between concurrent callers is required. Two callers
///   may populate the same slot; the last write wins.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Return the record at `key`, computing it with `populate` if absent
    /// or older than `revalidate`.
    async fn get_or_populate<'a>(
        &self,
        key: &CacheKey,
        revalidate: Duration,
        populate: PopulateFuture<'a>,
    ) -> CacheResult<CacheRecord<Value>>;

    /// Return the record at `key` if it is servable under `revalidate`,
    /// without populating. Counts a hit when a record is returned and
    /// nothing otherwise.
    async fn get(
        &self,
        key: &CacheKey,
        revalidate: Duration,
    ) -> CacheResult<Option<CacheRecord<Value>>>;

    /// Look at the record at `key` without populating or counting a hit.
    async fn peek(&self, key: &CacheKey) -> CacheResult<Option<CacheRecord<Value>>>;

    /// Drop every record carrying `tag`. Returns how many were removed.
    async fn invalidate_tag(&self, tag: &str) -> CacheResult<u64>;

    /// Get store statistics.
    async fn stats(&self) -> CacheResult<CacheStats>;
}

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a stored record.
    pub hits: u64,
    /// Lookups that had to run the populate future.
    pub misses: u64,
    /// Records written after a successful populate.
    pub populations: u64,
    /// Records removed by tag invalidation.
    pub invalidations: u64,
    /// Records currently stored.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total lookups (hits + misses).
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
        assert_eq!(stats.total_requests(), 100);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
