//! tagcache Query - Cached Query Executor
//!
//! Read-through execution of model queries against a shared [`TagStore`]:
//!
//! - [`CachedQueryExecutor`] composes tags, reads through the store and
//!   corrects stale records with a single forced refresh.
//! - [`ModelCache`] binds an executor to a [`ModelSource`] and adds the
//!   derived helpers `distinct` and `exists`.
//! - [`SingleFlight`] serialises refreshes per key when
//!   [`RefreshCoalescing::SingleFlight`](tagcache_core::RefreshCoalescing) is
//!   configured.
//!
//! [`TagStore`]: tagcache_store::TagStore

pub mod distinct;
pub mod executor;
pub mod model;
pub mod single_flight;
pub mod source;

pub use distinct::{extract_values, is_falsy, DistinctFields, DistinctOptions, DistinctOutput};
pub use executor::CachedQueryExecutor;
pub use model::ModelCache;
pub use single_flight::{FlightGuard, SingleFlight};
pub use source::ModelSource;
