//! Grouping id to params resolution.

use std::sync::Arc;

use tracing::debug;

use crate::error::ResolveError;
use crate::storage::GroupingStore;
use crate::types::{GroupingId, Params};

use super::cache::{CacheStats, GroupingCache};

/// Resolves grouping ids to their params, caching results in memory.
///
/// The cache lives for the lifetime of the process and is shared by every
/// unit of work.
pub struct GroupingResolver {
    store: Arc<dyn GroupingStore>,
    cache: GroupingCache,
}

impl GroupingResolver {
    /// Creates a resolver over `store` caching up to `capacity` groupings.
    pub fn new(store: Arc<dyn GroupingStore>, capacity: usize) -> Self {
        Self {
            store,
            cache: GroupingCache::new(capacity),
        }
    }

    /// Returns the params of `grouping`.
    ///
    /// Cache hits return without touching the store. A miss performs one point
    /// lookup and caches the result.
    pub async fn resolve(&self, grouping: GroupingId) -> Result<Params, ResolveError> {
        if let Some(params) = self.cache.get(&grouping) {
            return Ok(params);
        }

        debug!(grouping = %grouping, "Grouping cache miss");
        let params = self
            .store
            .grouping_params(grouping)
            .await?
            .ok_or(ResolveError::UnknownGrouping(grouping))?;

        self.cache.insert(grouping, params.clone());
        Ok(params)
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
