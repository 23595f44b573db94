//! Cached query executor.
//!
//! Reads through a [`TagStore`] with eager staleness correction: a record
//! whose age (rounded up to whole seconds) has reached `ttl` is never
//! returned as-is. The executor invalidates the base tag and reads through
//! once more, so callers see data at most `ttl` seconds old.
//!
//! # Costs and races
//!
//! - `ttl = 0` makes every record stale on arrival. Each call then performs
//!   two fetches: the population and the forced refresh.
//! - The forced refresh invalidates the *base* tag, which every cached query
//!   shares. One stale read clears the whole cache.
//! - With [`RefreshCoalescing::None`] two callers observing the same stale
//!   record both invalidate and both refetch. N concurrent callers cause at
//!   most N refreshes. [`RefreshCoalescing::SingleFlight`] serialises
//!   callers that find a key stale or empty so they share one refresh;
//!   fresh hits do not wait.
//! - With [`Revalidation::Background`] a record younger than `swr` is
//!   returned immediately and refreshed in a spawned task. The store keeps
//!   records for `max(ttl, swr)` in that mode.
//! - A strategy without a `ttl` uses [`CacheSettings::default_ttl_secs`].

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tagcache_core::{
    CacheError, CacheKey, CacheRecord, CacheResult, CacheSettings, CacheStrategy, Clock,
    ExpandedResult, QueryOutput, RefreshCoalescing, Revalidation, StoreError, SystemClock, TagSet,
};
use tagcache_store::{CacheStats, TagStore};
use tokio::task::JoinHandle;

use crate::single_flight::SingleFlight;

/// Read-through executor bound to one shared store.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryTagStore::new());
/// let executor = CachedQueryExecutor::with_defaults(store);
///
/// let tags = executor.tags_for("user", None);
/// let users: Vec<Row> = executor
///     .fetch_raw(tags, &args, &CacheStrategy::default(), move |args| {
///         let source = Arc::clone(&source);
///         async move { source.find_many(&args).await }
///     })
///     .await?;
/// ```
pub struct CachedQueryExecutor<S>
where
    S: TagStore,
{
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    flights: SingleFlight,
    revalidations: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S> CachedQueryExecutor<S>
where
    S: TagStore + 'static,
{
    /// Create an executor over `store`.
    ///
    /// `clock` must be the same clock the store stamps records with, or
    /// staleness is measured against the wrong origin.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: CacheSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            flights: SingleFlight::new(),
            revalidations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Executor on the system clock with default settings.
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, Arc::new(SystemClock), CacheSettings::default())
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Tag set for a cached query on `model`.
    pub fn tags_for(&self, model: &str, key: Option<&str>) -> TagSet {
        TagSet::for_model(&self.settings.base_tag, model, key)
    }

    /// Run a cached query.
    ///
    /// `args` feeds the cache key and is handed to `fetch` unchanged on a
    /// miss. Errors from `fetch` are returned as-is.
    pub async fn execute<T, A, F, Fut>(
        &self,
        tags: TagSet,
        args: &A,
        strategy: &CacheStrategy,
        fetch: F,
    ) -> CacheResult<QueryOutput<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let strategy = &self.resolve_strategy(strategy);
        let record = self.execute_record(tags, args, strategy, fetch).await?;
        if strategy.expanded_output {
            Ok(QueryOutput::Expanded(ExpandedResult::from_record(
                record,
                strategy,
                self.clock.now(),
            )))
        } else {
            Ok(QueryOutput::Raw(record.into_result()))
        }
    }

    /// Run a cached query and return the raw result, ignoring
    /// `strategy.expanded_output`.
    pub async fn fetch_raw<T, A, F, Fut>(
        &self,
        tags: TagSet,
        args: &A,
        strategy: &CacheStrategy,
        fetch: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let strategy = &self.resolve_strategy(strategy);
        let record = self.execute_record(tags, args, strategy, fetch).await?;
        Ok(record.into_result())
    }

    /// Run a cached query and return the metadata envelope, ignoring
    /// `strategy.expanded_output`.
    pub async fn fetch_expanded<T, A, F, Fut>(
        &self,
        tags: TagSet,
        args: &A,
        strategy: &CacheStrategy,
        fetch: F,
    ) -> CacheResult<ExpandedResult<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let strategy = &self.resolve_strategy(strategy);
        let record = self.execute_record(tags, args, strategy, fetch).await?;
        Ok(ExpandedResult::from_record(record, strategy, self.clock.now()))
    }

    /// `strategy` with an unset ttl filled from the settings.
    pub fn resolve_strategy(&self, strategy: &CacheStrategy) -> CacheStrategy {
        strategy.resolved(self.settings.default_ttl_secs)
    }

    /// Revalidation period handed to the store, in seconds.
    ///
    /// Background revalidation needs the store to keep a stale record until
    /// `swr` has passed, so the period is stretched to cover it.
    pub fn store_period(&self, strategy: &CacheStrategy) -> u64 {
        let ttl = strategy.effective_ttl();
        match self.settings.revalidation {
            Revalidation::Eager => ttl,
            Revalidation::Background => ttl.max(strategy.effective_swr()),
        }
    }

    /// Drop every record carrying `tag`, for every caller.
    pub async fn invalidate(&self, tag: &str) -> CacheResult<u64> {
        let removed = self.store.invalidate_tag(tag).await?;
        tracing::info!(tag, removed, "Cache tag invalidated");
        Ok(removed)
    }

    /// Get store statistics.
    pub async fn stats(&self) -> CacheResult<CacheStats> {
        self.store.stats().await
    }

    /// Background revalidations spawned and not yet awaited.
    pub fn pending_revalidations(&self) -> usize {
        let mut tasks = self
            .revalidations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.len()
    }

    /// Wait for every background revalidation spawned so far, including
    /// ones spawned while waiting.
    pub async fn wait_for_revalidations(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = {
                let mut tasks = self
                    .revalidations
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                std::mem::take(&mut *tasks)
            };
            if pending.is_empty() {
                break;
            }
            for task in pending {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Background revalidation task did not complete");
                }
            }
        }
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    async fn execute_record<T, A, F, Fut>(
        &self,
        tags: TagSet,
        args: &A,
        strategy: &CacheStrategy,
        fetch: F,
    ) -> CacheResult<CacheRecord<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        // An untagged slot could never be invalidated, so the forced refresh
        // would keep hitting it.
        let tags = if tags.is_empty() {
            TagSet::new().with(self.settings.base_tag.clone())
        } else {
            tags
        };
        let key = CacheKey::compose(tags, args)?;

        let record = match self.settings.coalescing {
            RefreshCoalescing::None => self.resolve(&key, args, strategy, &fetch).await?,
            RefreshCoalescing::SingleFlight => {
                // Fresh hits skip the flight; only stale or empty slots queue.
                let period = Duration::from_secs(self.store_period(strategy));
                match self.store.get(&key, period).await? {
                    Some(record) if !record.is_stale(strategy.effective_ttl(), self.clock.now()) => {
                        tracing::trace!(key = %key, "Serving fresh record");
                        record
                    }
                    _ => {
                        let _flight = self.flights.acquire(&key).await;
                        self.resolve(&key, args, strategy, &fetch).await?
                    }
                }
            }
        };

        record.try_map(decode::<T>)
    }

    /// Steps 2-4: read through, judge staleness, refresh at most once.
    async fn resolve<T, A, F, Fut>(
        &self,
        key: &CacheKey,
        args: &A,
        strategy: &CacheStrategy,
        fetch: &F,
    ) -> CacheResult<CacheRecord<Value>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let ttl = strategy.effective_ttl();
        let period = self.store_period(strategy);
        let record = self.read_through(key, period, args, fetch).await?;
        let stale_time = record.stale_time(self.clock.now());
        if stale_time < ttl {
            tracing::trace!(key = %key, stale_time, "Serving fresh record");
            return Ok(record);
        }

        if self.settings.revalidation == Revalidation::Background
            && stale_time < strategy.effective_swr()
            && self.spawn_revalidation(key.clone(), ttl, period, args.clone(), fetch.clone())
        {
            tracing::debug!(
                key = %key,
                stale_time,
                swr = strategy.effective_swr(),
                "Serving stale record while revalidating in background"
            );
            return Ok(record);
        }

        tracing::debug!(
            key = %key,
            stale_time,
            ttl,
            "Record stale, forcing refresh"
        );
        self.refresh_now(key, period, args, fetch).await
    }

    /// Invalidate the base tag and read through once more.
    ///
    /// If the second read fails the slot stays empty, so the next caller
    /// takes the miss path instead of seeing the expired record.
    async fn refresh_now<T, A, F, Fut>(
        &self,
        key: &CacheKey,
        period_secs: u64,
        args: &A,
        fetch: &F,
    ) -> CacheResult<CacheRecord<Value>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let base = key.tags().base().unwrap_or(self.settings.base_tag.as_str());
        let removed = self.store.invalidate_tag(base).await?;
        tracing::debug!(tag = base, removed, "Invalidated base tag for refresh");

        match self.read_through(key, period_secs, args, fetch).await {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Forced refresh failed, slot left empty");
                Err(e)
            }
        }
    }

    async fn read_through<T, A, F, Fut>(
        &self,
        key: &CacheKey,
        period_secs: u64,
        args: &A,
        fetch: &F,
    ) -> CacheResult<CacheRecord<Value>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let populate = async move {
            let result = fetch(args.clone()).await?;
            encode(&result)
        }
        .boxed();

        self.store
            .get_or_populate(key, Duration::from_secs(period_secs), populate)
            .await
    }

    /// Returns false when there is no runtime to spawn on; the caller then
    /// refreshes eagerly.
    fn spawn_revalidation<T, A, F, Fut>(
        &self,
        key: CacheKey,
        ttl_secs: u64,
        period_secs: u64,
        args: A,
        fetch: F,
    ) -> bool
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let executor = self.clone();
        let task = runtime.spawn(async move {
            let flight = match executor.settings.coalescing {
                RefreshCoalescing::SingleFlight => Some(executor.flights.acquire(&key).await),
                RefreshCoalescing::None => None,
            };
            if flight.is_some() {
                // Someone may have refreshed the slot while we waited.
                if let Ok(Some(current)) = executor.store.peek(&key).await {
                    if !current.is_stale(ttl_secs, executor.clock.now()) {
                        return;
                    }
                }
            }
            if let Err(e) = executor.refresh_now(&key, period_secs, &args, &fetch).await {
                tracing::warn!(key = %key, error = %e, "Background revalidation failed");
            }
        });

        let mut tasks = self
            .revalidations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
        true
    }
}

impl<S> Clone for CachedQueryExecutor<S>
where
    S: TagStore,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            settings: self.settings.clone(),
            flights: self.flights.clone(),
            revalidations: Arc::clone(&self.revalidations),
        }
    }
}

impl<S> std::fmt::Debug for CachedQueryExecutor<S>
where
    S: TagStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedQueryExecutor")
            .field("settings", &self.settings)
            .field("in_flight", &self.flights.in_flight())
            .finish()
    }
}

fn encode<T: Serialize>(result: &T) -> CacheResult<Value> {
    serde_json::to_value(result).map_err(|e| {
        CacheError::from(StoreError::Serialization {
            reason: e.to_string(),
        })
    })
}

fn decode<T: DeserializeOwned>(value: Value) -> CacheResult<T> {
    serde_json::from_value(value).map_err(|e| {
        CacheError::from(StoreError::Deserialization {
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::{join_all, BoxFuture};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tagcache_core::ManualClock;
    use tagcache_store::{ExpiryPolicy, InMemoryTagStore};

    type Fetch = Arc<dyn Fn(String) -> BoxFuture<'static, CacheResult<Vec<u64>>> + Send + Sync>;

    /// Fetch that returns `[n]` where n is the 1-based invocation number.
    #[derive(Clone)]
    struct Counter {
        calls: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
        yield_first: bool,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: Arc::new(AtomicBool::new(false)),
                yield_first: false,
            }
        }

        fn yielding() -> Self {
            Self {
                yield_first: true,
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn fetch(&self) -> Fetch {
            let calls = Arc::clone(&self.calls);
            let fail = Arc::clone(&self.fail);
            let yield_first = self.yield_first;
            Arc::new(move |_args: String| {
                let calls = Arc::clone(&calls);
                let fail = Arc::clone(&fail);
                async move {
                    if yield_first {
                        tokio::task::yield_now().await;
                    }
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if fail.load(Ordering::SeqCst) {
                        return Err(CacheError::fetch_failed("user", "source down"));
                    }
                    Ok(vec![n as u64])
                }
                .boxed()
            })
        }
    }

    struct Harness {
        clock: ManualClock,
        executor: CachedQueryExecutor<InMemoryTagStore>,
    }

    fn harness(expiry: ExpiryPolicy, settings: CacheSettings) -> Harness {
        let clock = ManualClock::at_epoch_2024();
        let store = Arc::new(InMemoryTagStore::with_clock(Arc::new(clock.clone())).with_expiry(expiry));
        let executor = CachedQueryExecutor::new(store, Arc::new(clock.clone()), settings);
        Harness { clock, executor }
    }

    async fn run(
        h: &Harness,
        counter: &Counter,
        strategy: &CacheStrategy,
    ) -> CacheResult<ExpandedResult<Vec<u64>>> {
        let fetch = counter.fetch();
        h.executor
            .fetch_expanded(
                h.executor.tags_for("user", strategy.key.as_deref()),
                &"where:all".to_string(),
                strategy,
                move |args| fetch(args),
            )
            .await
    }

    #[tokio::test]
    async fn test_fresh_read_is_served_from_cache() {
        let h = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        let first = run(&h, &counter, &strategy).await.expect("first");
        h.clock.advance_secs(5);
        let second = run(&h, &counter, &strategy).await.expect("second");

        assert_eq!(counter.calls(), 1);
        assert_eq!(second.result, first.result);
        assert_eq!(second.stale_time, 5);
        assert!(second.stale_time < 10);
    }

    #[tokio::test]
    async fn test_expired_read_refetches_once() {
        let h = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("first");
        h.clock.advance_secs(11);
        let refreshed = run(&h, &counter, &strategy).await.expect("refreshed");

        assert_eq!(counter.calls(), 2);
        assert_eq!(refreshed.result, vec![2]);
        assert_eq!(refreshed.cached_at, h.clock.now());
        assert_eq!(refreshed.stale_time, 0);
    }

    #[tokio::test]
    async fn test_stale_record_from_lagging_store_is_replaced() {
        let h = harness(ExpiryPolicy::Lazy, CacheSettings::default());
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("first");
        h.clock.advance_secs(11);
        let refreshed = run(&h, &counter, &strategy).await.expect("refreshed");

        assert_eq!(counter.calls(), 2);
        assert_eq!(refreshed.result, vec![2]);
        assert_eq!(refreshed.cached_at, h.clock.now());
        assert_eq!(refreshed.stale_time, 0);

        let stats = h.executor.stats().await.expect("stats");
        assert_eq!(stats.invalidations, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_fetches_twice_every_call() {
        let h = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        let counter = Counter::new();
        let strategy = CacheStrategy::new().with_ttl(0);

        run(&h, &counter, &strategy).await.expect("first");
        assert_eq!(counter.calls(), 2);
        run(&h, &counter, &strategy).await.expect("second");
        assert_eq!(counter.calls(), 4);
    }

    #[tokio::test]
    async fn test_zero_ttl_on_lagging_store_refreshes_every_call() {
        let h = harness(ExpiryPolicy::Lazy, CacheSettings::default());
        let counter = Counter::new();
        let strategy = CacheStrategy::new().with_ttl(0);

        // The store keeps serving the record, so only the refresh fetches.
        for expected in [2, 3, 4] {
            run(&h, &counter, &strategy).await.expect("call");
            assert_eq!(counter.calls(), expected);
        }
    }

    #[tokio::test]
    async fn test_expanded_output_reports_strategy_values() {
        let h = harness(ExpiryPolicy::Lazy, CacheSettings::default());
        let counter = Counter::new();

        let defaulted = CacheStrategy::new().with_ttl(10);
        let fresh = run(&h, &counter, &defaulted).await.expect("fresh");
        assert_eq!((fresh.ttl, fresh.swr), (10, 20));

        h.clock.advance_secs(30);
        let refreshed = run(&h, &counter, &defaulted).await.expect("refreshed");
        assert_eq!((refreshed.ttl, refreshed.swr), (10, 20));

        let explicit = CacheStrategy::new().with_ttl(3).with_swr(7);
        let out = run(&h, &counter, &explicit).await.expect("explicit");
        assert_eq!((out.ttl, out.swr), (3, 7));
        assert_eq!(out.timestamp, h.clock.now());
    }

    #[tokio::test]
    async fn test_execute_respects_expanded_flag() {
        let h = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        let counter = Counter::new();
        let fetch = counter.fetch();
        let tags = h.executor.tags_for("user", None);
        let args = "q".to_string();

        let raw: QueryOutput<Vec<u64>> = h
            .executor
            .execute(tags.clone(), &args, &CacheStrategy::default(), {
                let fetch = Arc::clone(&fetch);
                move |a| fetch(a)
            })
            .await
            .expect("raw");
        assert!(matches!(raw, QueryOutput::Raw(ref v) if v == &vec![1]));

        let expanded: QueryOutput<Vec<u64>> = h
            .executor
            .execute(tags, &args, &CacheStrategy::default().expanded(), move |a| fetch(a))
            .await
            .expect("expanded");
        assert_eq!(expanded.expanded().map(|e| e.ttl), Some(10));
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_propagates_and_leaves_slot_empty() {
        let h = harness(ExpiryPolicy::Lazy, CacheSettings::default());
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("first");
        h.clock.advance_secs(11);
        counter.set_failing(true);

        let err = run(&h, &counter, &strategy).await.expect_err("refresh fails");
        assert_eq!(err, CacheError::fetch_failed("user", "source down"));
        assert_eq!(h.executor.store().len().await, 0);

        counter.set_failing(false);
        let recovered = run(&h, &counter, &strategy).await.expect("recovered");
        assert_eq!(recovered.result, vec![3]);
        assert_eq!(recovered.stale_time, 0);
    }

    #[tokio::test]
    async fn test_failed_population_propagates_verbatim() {
        let h = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        let counter = Counter::new();
        counter.set_failing(true);

        let err = run(&h, &counter, &CacheStrategy::default())
            .await
            .expect_err("population fails");
        assert!(err.is_fetch_failure());
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidating_one_key_leaves_other_keys() {
        let h = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        let a = Counter::new();
        let b = Counter::new();
        let key_a = CacheStrategy::default().with_key("key-a");
        let key_b = CacheStrategy::default().with_key("key-b");

        run(&h, &a, &key_a).await.expect("a");
        run(&h, &b, &key_b).await.expect("b");
        assert_eq!(h.executor.invalidate("key-a").await.expect("invalidate"), 1);

        run(&h, &a, &key_a).await.expect("a again");
        run(&h, &b, &key_b).await.expect("b again");
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_base_tag_invalidation_clears_everything() {
        let h = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        let a = Counter::new();
        let b = Counter::new();

        run(&h, &a, &CacheStrategy::default().with_key("a")).await.expect("a");
        run(&h, &b, &CacheStrategy::default().with_key("b")).await.expect("b");

        assert_eq!(h.executor.invalidate("findManyCached").await.expect("invalidate"), 2);
        assert_eq!(h.executor.store().len().await, 0);
    }

    #[tokio::test]
    async fn test_empty_tags_fall_back_to_base_tag() {
        let h = harness(ExpiryPolicy::Lazy, CacheSettings::default());
        let counter = Counter::new();
        let fetch = counter.fetch();
        let strategy = CacheStrategy::default();

        let run_untagged = |fetch: Fetch| {
            let executor = &h.executor;
            let strategy = &strategy;
            async move {
                executor
                    .fetch_raw(TagSet::new(), &"q".to_string(), strategy, move |a| fetch(a))
                    .await
            }
        };

        run_untagged(Arc::clone(&fetch)).await.expect("first");
        h.clock.advance_secs(11);
        let refreshed: Vec<u64> = run_untagged(fetch).await.expect("refreshed");
        assert_eq!(refreshed, vec![2]);
    }

    #[tokio::test]
    async fn test_concurrent_stale_callers_each_refresh_without_coalescing() {
        let h = harness(ExpiryPolicy::Lazy, CacheSettings::default());
        let counter = Counter::yielding();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(11);

        let results = join_all((0..5).map(|_| run(&h, &counter, &strategy))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(counter.calls() > 2, "expected a refresh stampede, got {}", counter.calls());
    }

    #[tokio::test]
    async fn test_single_flight_shares_one_refresh() {
        let settings = CacheSettings::default().with_coalescing(RefreshCoalescing::SingleFlight);
        let h = harness(ExpiryPolicy::Lazy, settings);
        let counter = Counter::yielding();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(11);

        let results = join_all((0..5).map(|_| run(&h, &counter, &strategy))).await;
        for result in results {
            let expanded = result.expect("shared refresh");
            assert_eq!(expanded.result, vec![2]);
        }
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_background_revalidation_serves_stale_within_swr() {
        let settings = CacheSettings::default().with_revalidation(Revalidation::Background);
        let h = harness(ExpiryPolicy::Lazy, settings);
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(12);

        let stale = run(&h, &counter, &strategy).await.expect("stale served");
        assert_eq!(stale.result, vec![1]);
        assert_eq!(stale.stale_time, 12);
        assert!(stale.served_stale());

        h.executor.wait_for_revalidations().await;
        assert_eq!(counter.calls(), 2);
        assert_eq!(h.executor.pending_revalidations(), 0);

        let fresh = run(&h, &counter, &strategy).await.expect("fresh");
        assert_eq!(fresh.result, vec![2]);
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_background_revalidation_refreshes_eagerly_past_swr() {
        let settings = CacheSettings::default().with_revalidation(Revalidation::Background);
        let h = harness(ExpiryPolicy::Lazy, settings);
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(25);

        let out = run(&h, &counter, &strategy).await.expect("eager");
        assert_eq!(out.result, vec![2]);
        assert_eq!(out.stale_time, 0);
        assert_eq!(h.executor.pending_revalidations(), 0);
    }

    #[tokio::test]
    async fn test_background_failure_keeps_serving_after_retry() {
        let settings = CacheSettings::default().with_revalidation(Revalidation::Background);
        let h = harness(ExpiryPolicy::Lazy, settings);
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(12);
        counter.set_failing(true);

        let stale = run(&h, &counter, &strategy).await.expect("stale served");
        assert_eq!(stale.result, vec![1]);
        h.executor.wait_for_revalidations().await;

        // The failed background refresh invalidated the slot.
        counter.set_failing(false);
        let out = run(&h, &counter, &strategy).await.expect("miss path");
        assert_eq!(out.result, vec![3]);
    }

    #[tokio::test]
    async fn test_background_revalidation_on_expiring_store() {
        let settings = CacheSettings::default().with_revalidation(Revalidation::Background);
        let h = harness(ExpiryPolicy::OnRead, settings);
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(15);

        let stale = run(&h, &counter, &strategy).await.expect("stale served");
        assert_eq!(counter.calls(), 1);
        assert_eq!(stale.result, vec![1]);
        assert_eq!(stale.stale_time, 15);
        assert_eq!(h.executor.pending_revalidations(), 1);

        h.executor.wait_for_revalidations().await;
        assert_eq!(counter.calls(), 2);
        let fresh = run(&h, &counter, &strategy).await.expect("fresh");
        assert_eq!(fresh.result, vec![2]);
        assert_eq!(fresh.stale_time, 0);
    }

    #[tokio::test]
    async fn test_background_on_expiring_store_past_swr_refetches_inline() {
        let settings = CacheSettings::default().with_revalidation(Revalidation::Background);
        let h = harness(ExpiryPolicy::OnRead, settings);
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(20);

        let out = run(&h, &counter, &strategy).await.expect("refetched");
        assert_eq!(out.result, vec![2]);
        assert_eq!(out.stale_time, 0);
        assert_eq!(h.executor.pending_revalidations(), 0);
    }

    #[test]
    fn test_store_period_covers_swr_only_in_background() {
        let strategy = CacheStrategy::new().with_ttl(10).with_swr(45);
        let eager = harness(ExpiryPolicy::OnRead, CacheSettings::default());
        assert_eq!(eager.executor.store_period(&strategy), 10);

        let background = harness(
            ExpiryPolicy::OnRead,
            CacheSettings::default().with_revalidation(Revalidation::Background),
        );
        assert_eq!(background.executor.store_period(&strategy), 45);
        assert_eq!(
            background.executor.store_period(&CacheStrategy::new().with_ttl(10).with_swr(3)),
            10
        );
    }

    #[tokio::test]
    async fn test_unset_ttl_uses_configured_default() {
        let h = harness(
            ExpiryPolicy::OnRead,
            CacheSettings::default().with_default_ttl(60),
        );
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");
        h.clock.advance_secs(30);
        let cached = run(&h, &counter, &strategy).await.expect("cached");
        assert_eq!(counter.calls(), 1);
        assert_eq!((cached.ttl, cached.swr), (60, 70));

        h.clock.advance_secs(30);
        run(&h, &counter, &strategy).await.expect("refreshed");
        assert_eq!(counter.calls(), 2);

        let explicit = run(&h, &counter, &CacheStrategy::new().with_ttl(5))
            .await
            .expect("explicit");
        assert_eq!(explicit.ttl, 5);
    }

    #[tokio::test]
    async fn test_single_flight_fresh_hit_skips_held_flight() {
        let settings = CacheSettings::default().with_coalescing(RefreshCoalescing::SingleFlight);
        let h = harness(ExpiryPolicy::OnRead, settings);
        let counter = Counter::new();
        let strategy = CacheStrategy::default();

        run(&h, &counter, &strategy).await.expect("warm");

        let key = CacheKey::compose(h.executor.tags_for("user", None), &"where:all".to_string())
            .expect("compose");
        let _held = h.executor.flights.acquire(&key).await;

        let hit = tokio::time::timeout(Duration::from_secs(1), run(&h, &counter, &strategy))
            .await
            .expect("fresh hit must not wait on the flight")
            .expect("hit");
        assert_eq!(hit.result, vec![1]);
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_tags_for_uses_configured_base_tag() {
        let h = harness(
            ExpiryPolicy::OnRead,
            CacheSettings::default().with_base_tag("queries"),
        );
        let tags: Vec<String> = h
            .executor
            .tags_for("post", Some("feed"))
            .iter()
            .map(str::to_string)
            .collect();
        assert_eq!(tags, vec!["queries", "queries-post", "feed"]);
    }
}
