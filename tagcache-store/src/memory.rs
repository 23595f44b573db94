//! In-memory tag-indexed store.
//!
//! Uses `tokio::sync::RwLock` for async access. The lock is never held while
//! a populate future runs, so a slow source does not block other keys, and
//! two callers missing the same key both populate it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagcache_core::{CacheKey, CacheRecord, CacheResult, Clock, SystemClock};

use crate::traits::{CacheStats, PopulateFuture, TagStore};

/// When a record past its revalidation period stops being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryPolicy {
    /// Expired records are treated as absent on read.
    #[default]
    OnRead,
    /// Expired records keep being served until invalidated or purged.
    /// Freshness is then entirely up to the caller.
    Lazy,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    record: CacheRecord<Value>,
    revalidate: Duration,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<CacheKey, StoredEntry>,
    by_tag: HashMap<String, HashSet<CacheKey>>,
}

impl StoreState {
    fn insert(&mut self, key: CacheKey, entry: StoredEntry) {
        for tag in key.tags().iter() {
            self.by_tag
                .entry(tag.to_string())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        for tag in key.tags().iter() {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    populations: AtomicU64,
    invalidations: AtomicU64,
}

/// Process-local [`TagStore`].
pub struct InMemoryTagStore {
    state: tokio::sync::RwLock<StoreState>,
    clock: Arc<dyn Clock>,
    expiry: ExpiryPolicy,
    counters: Counters,
}

impl InMemoryTagStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store stamping records with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: tokio::sync::RwLock::new(StoreState::default()),
            clock,
            expiry: ExpiryPolicy::OnRead,
            counters: Counters::default(),
        }
    }

    /// Set the expiry policy.
    pub fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn expiry(&self) -> ExpiryPolicy {
        self.expiry
    }

    /// Number of stored records, expired or not.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Tags that currently index at least one record.
    pub async fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.state.read().await.by_tag.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Drop every record.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let removed = state.entries.len() as u64;
        state.entries.clear();
        state.by_tag.clear();
        self.counters
            .invalidations
            .fetch_add(removed, Ordering::Relaxed);
    }

    /// Remove records older than the revalidation period they were stored
    /// with. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| is_expired(&entry.record, entry.revalidate, now))
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired.len();
        for key in &expired {
            state.remove(key);
        }
        if count > 0 {
            tracing::debug!(count, "Purged expired cache records");
        }
        count
    }
}

impl Default for InMemoryTagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTagStore")
            .field("expiry", &self.expiry)
            .field("hits", &self.counters.hits.load(Ordering::Relaxed))
            .field("misses", &self.counters.misses.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryTagStore {
    /// The record at `key` if the expiry policy allows serving it. Counts a
    /// hit when it does.
    async fn servable(&self, key: &CacheKey, revalidate: Duration) -> Option<CacheRecord<Value>> {
        let state = self.state.read().await;
        let entry = state.entries.get(key)?;
        let servable = match self.expiry {
            ExpiryPolicy::OnRead => !is_expired(&entry.record, revalidate, self.clock.now()),
            ExpiryPolicy::Lazy => true,
        };
        if !servable {
            return None;
        }
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key = %key, "Cache store hit");
        Some(entry.record.clone())
    }
}

fn is_expired(record: &CacheRecord<Value>, revalidate: Duration, now: DateTime<Utc>) -> bool {
    let age = now
        .signed_duration_since(record.cached_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    age >= revalidate
}

#[async_trait]
impl TagStore for InMemoryTagStore {
    async fn get_or_populate<'a>(
        &self,
        key: &CacheKey,
        revalidate: Duration,
        populate: PopulateFuture<'a>,
    ) -> CacheResult<CacheRecord<Value>> {
        if let Some(record) = self.servable(key, revalidate).await {
            return Ok(record);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key = %key, "Cache store miss, populating");

        let value = populate.await?;
        let record = CacheRecord::new(value, self.clock.now());

        let mut state = self.state.write().await;
        state.insert(
            key.clone(),
            StoredEntry {
                record: record.clone(),
                revalidate,
            },
        );
        self.counters.populations.fetch_add(1, Ordering::Relaxed);

        Ok(record)
    }

    async fn get(
        &self,
        key: &CacheKey,
        revalidate: Duration,
    ) -> CacheResult<Option<CacheRecord<Value>>> {
        Ok(self.servable(key, revalidate).await)
    }

    async fn peek(&self, key: &CacheKey) -> CacheResult<Option<CacheRecord<Value>>> {
        let state = self.state.read().await;
        Ok(state.entries.get(key).map(|entry| entry.record.clone()))
    }

    async fn invalidate_tag(&self, tag: &str) -> CacheResult<u64> {
        let mut state = self.state.write().await;
        let keys: Vec<CacheKey> = state
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        let mut removed = 0u64;
        for key in &keys {
            if state.remove(key) {
                removed += 1;
            }
        }
        drop(state);

        self.counters
            .invalidations
            .fetch_add(removed, Ordering::Relaxed);
        tracing::debug!(tag, removed, "Invalidated cache tag");
        Ok(removed)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count = self.state.read().await.entries.len() as u64;
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            populations: self.counters.populations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entry_count,
        })
    }
}
