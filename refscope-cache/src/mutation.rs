//! Keeps the reference cache in step with writes made through mutations.

use std::future::Future;
use std::sync::Arc;

use refscope_core::{CacheKey, MutationError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::repository::Repository;
use crate::store::CacheStore;

/// Mutation wrappers bound to one repository.
///
/// Built for an unresolved scope, the wrappers still run the mutation but
/// touch no cache state.
#[derive(Clone)]
pub struct ReferenceMutations {
    repository: Option<Arc<Repository>>,
    store: Arc<dyn CacheStore>,
}

impl ReferenceMutations {
    pub(crate) fn new(repository: Option<Arc<Repository>>, store: Arc<dyn CacheStore>) -> Self {
        Self { repository, store }
    }

    /// Run a mutation that returns the created or updated entity, then
    /// upsert that entity into the reference entry.
    ///
    /// Aggregate queries over the same resource and scope (lists, counts)
    /// are marked stale. A failed mutation leaves the cache untouched and its
    /// error is returned as is.
    pub async fn with_reference_update<F, Fut, R, E>(&self, mutation: F) -> Result<R, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: Serialize,
    {
        let result = mutation().await?;
        let Some(repo) = &self.repository else {
            return Ok(result);
        };

        let patched = serde_json::to_value(&result)
            .map_err(|e| MutationError::Serialize {
                reason: e.to_string(),
            })
            .and_then(|entity| repo.patch(entity));
        match patched {
            Ok(id) => {
                let invalidated = self.invalidate_aggregates(repo.key());
                debug!(
                    resource_key = repo.resource_key(),
                    id = %id,
                    invalidated = invalidated,
                    "Synchronized mutation result"
                );
            }
            Err(err) => {
                // The write happened, so fall back to a full re-fetch
                warn!(resource_key = repo.resource_key(), error = %err, "Cannot patch mutation result");
                self.refresh(repo);
            }
        }
        Ok(result)
    }

    /// Run a mutation whose result does not carry the changed entity, then
    /// re-fetch the whole reference entry and mark every query over the same
    /// resource and scope stale.
    pub async fn with_reference_refresh<F, Fut, R, E>(&self, mutation: F) -> Result<R, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let result = mutation().await?;
        if let Some(repo) = &self.repository {
            self.refresh(repo);
        }
        Ok(result)
    }

    fn refresh(&self, repo: &Arc<Repository>) {
        repo.refresh();
        let key = repo.key();
        let invalidated = self
            .store
            .invalidate_where(&|k: &CacheKey| k.shares_resource_scope(key) && k != key);
        debug!(resource_key = repo.resource_key(), invalidated = invalidated, "Refreshed after mutation");
    }

    fn invalidate_aggregates(&self, key: &CacheKey) -> u64 {
        self.store
            .invalidate_where(&|k: &CacheKey| k.shares_resource_scope(key) && !key.is_prefix_of(k))
    }
}
