//! Tag sets and deterministic cache key composition.
//!
//! A cache slot is addressed by the ordered tag list plus a digest of the
//! query arguments. Arguments are first converted to a `serde_json::Value`,
//! whose object maps are key-sorted, so two argument values that serialize to
//! the same JSON always land in the same slot regardless of map iteration
//! order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CacheResult, StoreError};

/// Tag shared by every cached query in the process.
pub const DEFAULT_BASE_TAG: &str = "findManyCached";

/// Separator between the tag list and the argument digest in encoded keys.
const KEY_SEPARATOR: char = '|';

/// Ordered, duplicate-free set of invalidation tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TagSet {
    tags: Vec<String>,
}

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags for a cached query on `model`: base tag, model tag, then the
    /// optional caller key.
    pub fn for_model(base_tag: &str, model: &str, key: Option<&str>) -> Self {
        let mut tags = Self::new();
        tags.push(base_tag);
        tags.push(model_tag(base_tag, model));
        if let Some(key) = key {
            tags.push(key);
        }
        tags
    }

    /// Append a tag unless it is empty or already present.
    pub fn push(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !tag.is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, tag: impl Into<String>) -> Self {
        self.push(tag);
        self
    }

    /// The first tag, which the executor invalidates on a stale read.
    pub fn base(&self) -> Option<&str> {
        self.tags.first().map(String::as_str)
    }

    /// Returns true if `tag` is a member.
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut tags = TagSet::new();
        for tag in iter {
            tags.push(tag);
        }
        tags
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tags.join(","))
    }
}

/// Model-scoped tag, e.g. `findManyCached-user`.
pub fn model_tag(base_tag: &str, model: &str) -> String {
    format!("{}-{}", base_tag, model)
}

/// Caller key used by distinct projections on `model`, e.g. `user-distinct`.
pub fn distinct_key(model: &str) -> String {
    format!("{}-distinct", model)
}

/// Address of one store slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    tags: TagSet,
    args_digest: String,
}

impl CacheKey {
    /// Compose a key from tags and query arguments.
    ///
    /// Fails only if `args` cannot be represented as JSON.
    pub fn compose<A: Serialize + ?Sized>(tags: TagSet, args: &A) -> CacheResult<Self> {
        let canonical = serde_json::to_value(args).map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        })?;
        let bytes = serde_json::to_vec(&canonical).map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(Self {
            tags,
            args_digest: hex::encode(hasher.finalize()),
        })
    }

    /// Tags carried by this slot.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Hex SHA-256 of the canonical argument JSON.
    pub fn args_digest(&self) -> &str {
        &self.args_digest
    }

    /// Flat string form, `tag1,tag2|digest`.
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.tags, KEY_SEPARATOR, self.args_digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
