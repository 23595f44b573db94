//! Record source capability.

use async_trait::async_trait;
use tagcache_core::{CacheResult, Filter, FindManyArgs, Row};

/// Any backing collection that can answer bulk queries for one model.
///
/// Implementations interpret [`FindManyArgs`] themselves (the cache treats it
/// as opaque) and must honour `select`, `distinct`, `skip` and `take` so that
/// the derived helpers see the projection they asked for. Errors are returned
/// to the caller untouched.
#[async_trait]
pub trait ModelSource: Send + Sync {
    /// Model name, used to scope tags (`findManyCached-<model>`).
    fn model_name(&self) -> &str;

    /// Return every record matching `args`, in source order.
    async fn find_many(&self, args: &FindManyArgs) -> CacheResult<Vec<Row>>;

    /// Return the first record matching `filter`, if any.
    async fn find_first(&self, filter: Option<&Filter>) -> CacheResult<Option<Row>>;
}
