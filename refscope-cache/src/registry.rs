//! Process-wide registry of repositories, keyed by (resource key, cache key).

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use refscope_core::{CacheKey, ReferenceFetcher, ResourceDescriptor};
use refscope_events::{EventBus, Listener};
use tracing::{debug, info};

use crate::repository::{Repository, RepositoryDeps};

/// Emits a resolution request for one id.
pub type Resolver = Arc<dyn Fn(&str) + Send + Sync>;

/// Hands out exactly one [`Repository`] per (resource key, cache key).
///
/// The first registration wins: later lookups with a different fetch function
/// reuse the existing repository and its fetcher.
pub struct RepositoryRegistry {
    repositories: DashMap<(String, CacheKey), Arc<Repository>>,
    bus: Arc<EventBus<String>>,
    deps: RepositoryDeps,
}

impl RepositoryRegistry {
    pub fn new(deps: RepositoryDeps) -> Self {
        Self {
            repositories: DashMap::new(),
            bus: Arc::new(EventBus::new()),
            deps,
        }
    }

    /// Shared collaborators given to every repository.
    pub fn deps(&self) -> &RepositoryDeps {
        &self.deps
    }

    /// Get or create the repository for `descriptor` under `key`.
    pub fn get(
        &self,
        descriptor: &ResourceDescriptor,
        key: &CacheKey,
        fetcher: Arc<dyn ReferenceFetcher>,
    ) -> Arc<Repository> {
        let id = (descriptor.resource_key.clone(), key.clone());
        match self.repositories.entry(id) {
            Entry::Occupied(existing) => {
                debug!(resource_key = %descriptor.resource_key, cache_key = %key, "Reusing repository");
                Arc::clone(existing.get())
            }
            Entry::Vacant(vacant) => {
                let repo = Repository::new(
                    Arc::new(descriptor.clone()),
                    key.clone(),
                    fetcher,
                    self.deps.clone(),
                );
                let weak = Arc::downgrade(&repo);
                let listener: Listener<String> = Arc::new(move |id: &String| {
                    if let Some(repo) = weak.upgrade() {
                        repo.request_item(id);
                    }
                });
                self.bus.on(repo.topic(), listener);
                info!(resource_key = %descriptor.resource_key, cache_key = %key, "Created repository");
                vacant.insert(Arc::clone(&repo));
                repo
            }
        }
    }

    /// Existing repository, if any.
    pub fn find(&self, resource_key: &str, key: &CacheKey) -> Option<Arc<Repository>> {
        self.repositories
            .get(&(resource_key.to_string(), key.clone()))
            .map(|r| Arc::clone(r.value()))
    }

    /// A resolver that wakes `repo` through the event bus.
    pub fn resolver_for(&self, repo: &Arc<Repository>) -> Resolver {
        let bus = Arc::clone(&self.bus);
        let topic = repo.topic().clone();
        Arc::new(move |id: &str| bus.emit(&topic, &id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}
