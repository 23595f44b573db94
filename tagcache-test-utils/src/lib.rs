//! tagcache Test Utilities
//!
//! Shared test infrastructure for the tagcache workspace:
//! - An in-memory model source with call counters and failure injection
//! - Proptest generators for tags, arguments and rows
//! - Fixtures and a manual-clock test harness
//! - Assertions for cache-specific outcomes
//! - Tracing setup for tests

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// Re-export core types for convenience
pub use tagcache_core::{
    CacheError, CacheKey, CacheResult, CacheSettings, CacheStrategy, Clock, ExpandedResult,
    Filter, FindManyArgs, ManualClock, QueryOutput, RefreshCoalescing, Revalidation, Row, TagSet,
};
pub use tagcache_query::{CachedQueryExecutor, DistinctOptions, DistinctOutput, ModelCache, ModelSource};
pub use tagcache_store::{ExpiryPolicy, InMemoryTagStore, TagStore};

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to debug output from the tagcache crates.
pub fn init_test_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tagcache_query=debug,tagcache_store=debug,warn"));

    // A second call in the same process finds a subscriber already set.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// IN-MEMORY MODEL SOURCE
// ============================================================================

/// Model source over a vector of rows.
///
/// Filters are objects of field equalities. A field missing from a row
/// compares equal to `null`. `orderBy` accepts `{ "<field>": "asc" | "desc" }`.
#[derive(Debug)]
pub struct InMemoryModelSource {
    model: String,
    rows: RwLock<Vec<Row>>,
    honour_distinct: bool,
    yield_before_fetch: bool,
    failing: AtomicBool,
    find_many_calls: AtomicUsize,
    find_first_calls: AtomicUsize,
    last_args: Mutex<Option<FindManyArgs>>,
}

impl InMemoryModelSource {
    pub fn new(model: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            model: model.into(),
            rows: RwLock::new(rows),
            honour_distinct: true,
            yield_before_fetch: false,
            failing: AtomicBool::new(false),
            find_many_calls: AtomicUsize::new(0),
            find_first_calls: AtomicUsize::new(0),
            last_args: Mutex::new(None),
        }
    }

    pub fn empty(model: impl Into<String>) -> Self {
        Self::new(model, Vec::new())
    }

    /// Ignore `distinct` in arguments, like a source without native support.
    pub fn ignoring_distinct(mut self) -> Self {
        self.honour_distinct = false;
        self
    }

    /// Yield to the scheduler before answering `find_many`, so concurrent
    /// callers interleave on a single-threaded runtime.
    pub fn yielding(mut self) -> Self {
        self.yield_before_fetch = true;
        self
    }

    pub fn insert(&self, row: Row) {
        self.rows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(row);
    }

    pub fn replace(&self, rows: Vec<Row>) {
        *self
            .rows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = rows;
    }

    pub fn clear(&self) {
        self.replace(Vec::new());
    }

    /// Make every subsequent call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn find_many_calls(&self) -> usize {
        self.find_many_calls.load(Ordering::SeqCst)
    }

    pub fn find_first_calls(&self) -> usize {
        self.find_first_calls.load(Ordering::SeqCst)
    }

    /// Arguments of the most recent `find_many`.
    pub fn last_args(&self) -> Option<FindManyArgs> {
        self.last_args
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reset_counts(&self) {
        self.find_many_calls.store(0, Ordering::SeqCst);
        self.find_first_calls.store(0, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Vec<Row> {
        self.rows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn check_failing(&self) -> CacheResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::fetch_failed(&self.model, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelSource for InMemoryModelSource {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn find_many(&self, args: &FindManyArgs) -> CacheResult<Vec<Row>> {
        if self.yield_before_fetch {
            tokio::task::yield_now().await;
        }
        self.find_many_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .last_args
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(args.clone());
        self.check_failing()?;

        let mut rows: Vec<Row> = self
            .snapshot()
            .into_iter()
            .filter(|row| matches_filter(row, args.filter.as_ref()))
            .collect();

        if let Some(order_by) = &args.order_by {
            sort_rows(&mut rows, order_by);
        }

        if self.honour_distinct {
            if let Some(fields) = &args.distinct {
                let mut seen: Vec<Vec<Value>> = Vec::new();
                rows.retain(|row| {
                    let combo = project_values(row, fields);
                    if seen.contains(&combo) {
                        false
                    } else {
                        seen.push(combo);
                        true
                    }
                });
            }
        }

        let rows = rows
            .into_iter()
            .skip(args.skip.unwrap_or(0))
            .take(args.take.unwrap_or(usize::MAX));

        Ok(match &args.select {
            Some(fields) => rows.map(|row| select_fields(&row, fields)).collect(),
            None => rows.collect(),
        })
    }

    async fn find_first(&self, filter: Option<&Filter>) -> CacheResult<Option<Row>> {
        self.find_first_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self
            .snapshot()
            .into_iter()
            .find(|row| matches_filter(row, filter)))
    }
}

/// Equality match of every filter field against the row.
///
/// `None`, `null` and non-object filters match everything.
pub fn matches_filter(row: &Row, filter: Option<&Filter>) -> bool {
    let Some(Value::Object(conditions)) = filter else {
        return true;
    };
    conditions
        .iter()
        .all(|(field, expected)| row.get(field).unwrap_or(&Value::Null) == expected)
}

fn project_values(row: &Row, fields: &[String]) -> Vec<Value> {
    fields
        .iter()
        .map(|field| row.get(field).cloned().unwrap_or(Value::Null))
        .collect()
}

fn select_fields(row: &Row, fields: &[String]) -> Row {
    fields
        .iter()
        .filter_map(|field| row.get(field).map(|v| (field.clone(), v.clone())))
        .collect()
}

fn sort_rows(rows: &mut [Row], order_by: &Value) {
    let Value::Object(order) = order_by else {
        return;
    };
    let Some((field, direction)) = order.iter().next() else {
        return;
    };
    let descending = direction.as_str() == Some("desc");
    rows.sort_by(|a, b| {
        let ord = compare_values(a.get(field), b.get(field));
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Nulls first, then booleans, numbers, strings, and everything else.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(_) => 4,
    }
}

// ============================================================================
// TEST HARNESS
// ============================================================================

/// A store, executor and `user` model sharing one manual clock.
pub struct TestCache {
    pub clock: ManualClock,
    pub store: Arc<InMemoryTagStore>,
    pub executor: CachedQueryExecutor<InMemoryTagStore>,
    pub users: ModelCache<InMemoryTagStore, InMemoryModelSource>,
}

impl TestCache {
    /// Default settings, expiring store, fixture users.
    pub fn new() -> Self {
        Self::with(
            CacheSettings::default(),
            ExpiryPolicy::OnRead,
            InMemoryModelSource::new("user", fixtures::users()),
        )
    }

    pub fn with(settings: CacheSettings, expiry: ExpiryPolicy, source: InMemoryModelSource) -> Self {
        let clock = ManualClock::at_epoch_2024();
        let store =
            Arc::new(InMemoryTagStore::with_clock(Arc::new(clock.clone())).with_expiry(expiry));
        let executor = CachedQueryExecutor::new(Arc::clone(&store), Arc::new(clock.clone()), settings);
        let users = ModelCache::new(executor.clone(), Arc::new(source));
        Self {
            clock,
            store,
            executor,
            users,
        }
    }

    /// Another model on the same store and clock.
    pub fn model(&self, source: InMemoryModelSource) -> ModelCache<InMemoryTagStore, InMemoryModelSource> {
        ModelCache::new(self.executor.clone(), Arc::new(source))
    }

    pub fn source(&self) -> &InMemoryModelSource {
        self.users.source()
    }
}

impl Default for TestCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tagcache inputs.

    use super::*;
    use proptest::prelude::*;

    /// A non-empty tag.
    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,12}"
    }

    /// A tag set with 1 to 4 tags.
    pub fn arb_tag_set() -> impl Strategy<Value = TagSet> {
        prop::collection::vec(arb_tag(), 1..5).prop_map(|tags| tags.into_iter().collect())
    }

    /// A JSON scalar, including the falsy ones.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            (-5i64..5).prop_map(Value::from),
            "[a-d]{0,3}".prop_map(Value::from),
        ]
    }

    /// A field value: a scalar or a short array of scalars.
    pub fn arb_field_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            3 => arb_scalar(),
            1 => prop::collection::vec(arb_scalar(), 0..4).prop_map(Value::Array),
        ]
    }

    /// A row over the fields `a`, `b` and `c`, any of which may be absent.
    pub fn arb_row() -> impl Strategy<Value = Row> {
        (
            prop::option::of(arb_field_value()),
            prop::option::of(arb_field_value()),
            prop::option::of(arb_field_value()),
        )
            .prop_map(|(a, b, c)| {
                let mut row = Row::new();
                for (name, value) in [("a", a), ("b", b), ("c", c)] {
                    if let Some(value) = value {
                        row.insert(name.to_string(), value);
                    }
                }
                row
            })
    }

    /// Query arguments with an optional equality filter and paging.
    pub fn arb_args() -> impl Strategy<Value = FindManyArgs> {
        (
            prop::option::of(("[a-c]", arb_scalar())),
            prop::option::of(0usize..5),
            prop::option::of(1usize..10),
        )
            .prop_map(|(filter, skip, take)| {
                let mut args = FindManyArgs::new().with_take(take);
                if let Some((field, value)) = filter {
                    let mut conditions = Row::new();
                    conditions.insert(field, value);
                    args = args.with_filter(Value::Object(conditions));
                }
                if let Some(skip) = skip {
                    args = args.with_skip(skip);
                }
                args
            })
    }

    /// A strategy with ttl up to 120s and an optional explicit swr.
    pub fn arb_strategy() -> impl Strategy<Value = CacheStrategy> {
        (0u64..120, prop::option::of(0u64..240), any::<bool>()).prop_map(|(ttl, swr, expanded)| {
            let mut strategy = CacheStrategy::new().with_ttl(ttl);
            if let Some(swr) = swr {
                strategy = strategy.with_swr(swr);
            }
            if expanded {
                strategy = strategy.expanded();
            }
            strategy
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built rows for common scenarios.

    use super::*;
    use serde_json::json;

    /// Turn a JSON object literal into a row. Non-objects become empty rows.
    pub fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    /// Six users. `city` repeats and includes null, empty and missing values;
    /// `tags` is an array including an empty one.
    pub fn users() -> Vec<Row> {
        vec![
            row(json!({ "id": 1, "name": "Ada", "city": "Oslo", "active": true, "age": 36, "tags": ["admin", "ops"] })),
            row(json!({ "id": 2, "name": "Brian", "city": "Lima", "active": false, "age": 0, "tags": [] })),
            row(json!({ "id": 3, "name": "Chen", "city": "Oslo", "active": true, "age": 29, "tags": ["ops", ""] })),
            row(json!({ "id": 4, "name": "Dara", "city": null, "active": true, "age": 41, "tags": ["dev"] })),
            row(json!({ "id": 5, "name": "Eve", "city": "", "active": false, "age": 22 })),
            row(json!({ "id": 6, "name": "Farid", "active": true, "age": 51, "tags": ["dev", "admin"] })),
        ]
    }

    /// Three posts authored by fixture users.
    pub fn posts() -> Vec<Row> {
        vec![
            row(json!({ "id": 10, "authorId": 1, "title": "Caching", "published": true })),
            row(json!({ "id": 11, "authorId": 3, "title": "Tags", "published": false })),
            row(json!({ "id": 12, "authorId": 1, "title": "Staleness", "published": true })),
        ]
    }

    pub fn users_source() -> InMemoryModelSource {
        InMemoryModelSource::new("user", users())
    }

    pub fn posts_source() -> InMemoryModelSource {
        InMemoryModelSource::new("post", posts())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache outcomes.

    use super::*;

    /// Assert the envelope was served within its freshness window.
    #[track_caller]
    pub fn assert_fresh<T: std::fmt::Debug>(expanded: &ExpandedResult<T>) {
        assert!(
            expanded.stale_time < expanded.ttl || expanded.ttl == 0,
            "Expected fresh result, got stale_time {} with ttl {}: {:?}",
            expanded.stale_time,
            expanded.ttl,
            expanded
        );
    }

    /// Assert the envelope was refreshed at `now`.
    #[track_caller]
    pub fn assert_refreshed_at<T: std::fmt::Debug>(expanded: &ExpandedResult<T>, now: tagcache_core::Timestamp) {
        assert_eq!(expanded.cached_at, now, "Expected refresh at {now}: {expanded:?}");
        assert_eq!(expanded.stale_time, 0, "Expected zero stale time: {expanded:?}");
    }

    /// Assert a result is a fetch failure.
    #[track_caller]
    pub fn assert_fetch_failed<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(e) if e.is_fetch_failure() => {}
            other => panic!("Expected fetch failure, got: {:?}", other),
        }
    }

    /// Assert no value in `values` is falsy.
    #[track_caller]
    pub fn assert_all_truthy(values: &[Value]) {
        if let Some(bad) = values.iter().find(|v| tagcache_query::is_falsy(v)) {
            panic!("Expected only truthy values, found {bad} in {values:?}");
        }
    }
}
