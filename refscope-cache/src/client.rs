//! Consumer entry point: one client per application session.

use std::sync::{Arc, PoisonError, RwLock};

use refscope_core::{
    build_scoped_key, ErrorReporter, KeyPart, RefResult, ReferenceAdaptor, ReferenceConfig,
    ReferenceFetcher, ResourceDescriptor, ScopeContext, ScopeError, ScopedKey,
    TracingErrorReporter, REFERENCE_VERB,
};
use tracing::{debug, info};

use crate::mutation::ReferenceMutations;
use crate::projection::ReferenceProjection;
use crate::proxy::ReferenceMap;
use crate::registry::RepositoryRegistry;
use crate::repository::RepositoryDeps;
use crate::store::{CacheStore, InMemoryCacheStore};
use crate::subscription::{ConsumerHandle, SubscriptionManager};

/// What a consumer gets for one resource type.
pub struct ReferenceHandle<T> {
    pub map: ReferenceMap<T>,
    pub mutations: ReferenceMutations,
}

/// Owns the registry, the subscription manager and the current scope.
pub struct ReferenceClient {
    store: Arc<dyn CacheStore>,
    registry: RepositoryRegistry,
    subscriptions: SubscriptionManager,
    scope: RwLock<ScopeContext>,
}

impl ReferenceClient {
    /// Client over `store`, reporting fetch failures through `tracing`.
    pub fn new(store: Arc<dyn CacheStore>, config: ReferenceConfig) -> RefResult<Self> {
        Self::with_reporter(store, Arc::new(TracingErrorReporter), config)
    }

    /// Client over a fresh [`InMemoryCacheStore`].
    pub fn in_memory(config: ReferenceConfig) -> RefResult<Self> {
        Self::new(Arc::new(InMemoryCacheStore::new()), config)
    }

    pub fn with_reporter(
        store: Arc<dyn CacheStore>,
        reporter: Arc<dyn ErrorReporter>,
        config: ReferenceConfig,
    ) -> RefResult<Self> {
        config.validate()?;
        info!(
            flush_delay_ms = config.flush_delay.as_millis() as u64,
            max_batch_size = config.max_batch_size,
            max_concurrent_fetches = ?config.max_concurrent_fetches,
            "Reference client created"
        );
        let deps = RepositoryDeps::new(Arc::clone(&store), reporter, config);
        Ok(Self {
            store,
            registry: RepositoryRegistry::new(deps),
            subscriptions: SubscriptionManager::new(),
            scope: RwLock::new(ScopeContext::default()),
        })
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn registry(&self) -> &RepositoryRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Replace the session scope. Handles created earlier keep the scope
    /// they were built with.
    pub fn set_scope(&self, scope: ScopeContext) {
        *self.scope.write().unwrap_or_else(PoisonError::into_inner) = scope;
    }

    pub fn scope(&self) -> ScopeContext {
        self.scope.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Key for a query over `descriptor` under the current scope.
    pub fn scoped_key(&self, descriptor: &ResourceDescriptor, verb: &str, context: Option<KeyPart>) -> ScopedKey {
        build_scoped_key(
            &descriptor.required_tiers,
            &self.scope(),
            &descriptor.resource_key,
            verb,
            context,
        )
    }

    /// Reference map and mutation wrappers for `descriptor`.
    ///
    /// The map stops updating once `consumer` is disposed. Under an
    /// unresolved scope the map is disabled and the mutations leave the cache
    /// alone.
    pub fn reference<T>(
        &self,
        descriptor: &ResourceDescriptor,
        fetcher: Arc<dyn ReferenceFetcher>,
        adaptor: Arc<dyn ReferenceAdaptor<T>>,
        consumer: ConsumerHandle,
    ) -> ReferenceHandle<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let type_info = descriptor.type_info();
        match self.scoped_key(descriptor, REFERENCE_VERB, None) {
            ScopedKey::Resolved(key) => {
                let repo = self.registry.get(descriptor, &key, fetcher);
                let resolver = self.registry.resolver_for(&repo);
                let projection = ReferenceProjection::subscribe(Arc::clone(&repo), adaptor, resolver);

                let teardown = Arc::clone(&projection);
                self.subscriptions
                    .register(consumer, Box::new(move || teardown.unsubscribe()));

                ReferenceHandle {
                    map: ReferenceMap::attached(projection, type_info),
                    mutations: ReferenceMutations::new(Some(repo), Arc::clone(&self.store)),
                }
            }
            ScopedKey::Unresolved { missing } => {
                debug!(
                    resource_key = %descriptor.resource_key,
                    missing = ?missing,
                    "Scope unresolved, reference map disabled"
                );
                ReferenceHandle {
                    map: ReferenceMap::disabled(type_info),
                    mutations: ReferenceMutations::new(None, Arc::clone(&self.store)),
                }
            }
        }
    }

    /// Load every entity of `descriptor` under the current scope.
    pub async fn preload(
        &self,
        descriptor: &ResourceDescriptor,
        fetcher: Arc<dyn ReferenceFetcher>,
        force: bool,
    ) -> RefResult<usize> {
        match self.scoped_key(descriptor, REFERENCE_VERB, None) {
            ScopedKey::Resolved(key) => self.registry.get(descriptor, &key, fetcher).preload(force).await,
            ScopedKey::Unresolved { missing } => Err(ScopeError::Unresolved {
                resource_key: descriptor.resource_key.clone(),
                missing,
            }
            .into()),
        }
    }

    /// Tear down every subscription held by `consumer`.
    pub fn dispose(&self, consumer: ConsumerHandle) -> usize {
        self.subscriptions.dispose(consumer)
    }
}
