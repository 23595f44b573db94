//! Model-scoped cached queries and the derived helpers.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tagcache_core::{
    distinct_key, model_tag, CacheError, CacheResult, CacheStrategy, Filter, FindManyArgs,
    QueryOutput, Row, StoreError,
};
use tagcache_store::TagStore;

use crate::distinct::{extract_values, DistinctFields, DistinctOptions, DistinctOutput};
use crate::executor::CachedQueryExecutor;
use crate::source::ModelSource;

/// An executor bound to one model's source.
///
/// Every cached query issued here is tagged with the base tag and
/// `<base>-<model>`, plus the strategy's `key` when set.
pub struct ModelCache<S, M>
where
    S: TagStore,
    M: ModelSource,
{
    executor: CachedQueryExecutor<S>,
    source: Arc<M>,
}

impl<S, M> ModelCache<S, M>
where
    S: TagStore + 'static,
    M: ModelSource + 'static,
{
    pub fn new(executor: CachedQueryExecutor<S>, source: Arc<M>) -> Self {
        Self { executor, source }
    }

    pub fn executor(&self) -> &CachedQueryExecutor<S> {
        &self.executor
    }

    pub fn source(&self) -> &Arc<M> {
        &self.source
    }

    pub fn model_name(&self) -> &str {
        self.source.model_name()
    }

    /// Cached `find_many`, rows decoded into `T`.
    pub async fn find_many_cached<T>(
        &self,
        args: &FindManyArgs,
        strategy: &CacheStrategy,
    ) -> CacheResult<QueryOutput<Vec<T>>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let tags = self
            .executor
            .tags_for(self.source.model_name(), strategy.key.as_deref());
        let source = Arc::clone(&self.source);

        self.executor
            .execute(tags, args, strategy, move |args: FindManyArgs| {
                let source = Arc::clone(&source);
                async move {
                    let rows = source.find_many(&args).await?;
                    rows.into_iter()
                        .map(decode_row::<T>)
                        .collect::<CacheResult<Vec<T>>>()
                }
            })
            .await
    }

    /// Drop every cached query on this model. Other models keep theirs.
    pub async fn invalidate_model(&self) -> CacheResult<u64> {
        let tag = model_tag(&self.executor.settings().base_tag, self.source.model_name());
        self.executor.invalidate(&tag).await
    }

    /// Distinct values of `fields` among records matching `filter`.
    ///
    /// A single field yields its truthy values, arrays flattened one level.
    /// Several fields yield the projected rows unchanged. Either way nothing
    /// is deduplicated here; that is left to the source's own distinct.
    pub async fn distinct(
        &self,
        fields: impl Into<DistinctFields>,
        filter: Option<Filter>,
        options: DistinctOptions,
    ) -> CacheResult<DistinctOutput> {
        let fields = fields.into();
        let names = fields.names();

        let mut args = FindManyArgs::new()
            .with_select(names.iter().cloned())
            .with_distinct(names)
            .with_take(options.take);
        args.filter = filter;

        let ttl = options
            .ttl
            .unwrap_or(self.executor.settings().distinct_ttl_secs);
        let strategy = CacheStrategy::new()
            .with_ttl(ttl)
            .with_key(distinct_key(self.source.model_name()));

        let rows: Vec<Row> = self
            .find_many_cached(&args, &strategy)
            .await?
            .into_result();

        Ok(match fields {
            DistinctFields::One(field) => DistinctOutput::Values(extract_values(&field, rows)),
            DistinctFields::Many(_) => DistinctOutput::Rows(rows),
        })
    }

    /// Whether any record matches `filter` right now. Never cached.
    pub async fn exists(&self, filter: Option<&Filter>) -> CacheResult<bool> {
        let found = self.source.find_first(filter).await?.is_some();
        tracing::trace!(model = self.source.model_name(), found, "Existence check");
        Ok(found)
    }
}

impl<S, M> Clone for ModelCache<S, M>
where
    S: TagStore,
    M: ModelSource,
{
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            source: Arc::clone(&self.source),
        }
    }
}

fn decode_row<T: DeserializeOwned>(row: Row) -> CacheResult<T> {
    serde_json::from_value(Value::Object(row)).map_err(|e| {
        CacheError::from(StoreError::Deserialization {
            reason: e.to_string(),
        })
    })
}
