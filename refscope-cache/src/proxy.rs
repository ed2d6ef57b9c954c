//! Consumer-facing lazy lookup table of reference slots.

use std::sync::Arc;

use refscope_core::{ReferenceItem, ReferenceTypeInfo};

use crate::projection::{ReferenceProjection, ReferenceSlot, SlotTable};

/// Lazily populated id → item view.
///
/// Reading an id that is not yet tracked starts tracking it and, if the
/// item is unresolved, asks the repository to fetch it. A map built for an
/// unresolved scope is disabled: every slot stays empty and nothing is
/// fetched.
pub struct ReferenceMap<T> {
    projection: Option<Arc<ReferenceProjection<T>>>,
    detached: Arc<SlotTable<T>>,
    type_info: ReferenceTypeInfo,
}

impl<T> Clone for ReferenceMap<T> {
    fn clone(&self) -> Self {
        Self {
            projection: self.projection.clone(),
            detached: Arc::clone(&self.detached),
            type_info: self.type_info.clone(),
        }
    }
}

impl<T> ReferenceMap<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn attached(projection: Arc<ReferenceProjection<T>>, type_info: ReferenceTypeInfo) -> Self {
        Self {
            projection: Some(projection),
            detached: Arc::new(SlotTable::default()),
            type_info,
        }
    }

    pub(crate) fn disabled(type_info: ReferenceTypeInfo) -> Self {
        Self {
            projection: None,
            detached: Arc::new(SlotTable::default()),
            type_info,
        }
    }

    /// Slot for `id`. Repeated reads return the same slot.
    pub fn get(&self, id: &str) -> ReferenceSlot<T> {
        match &self.projection {
            Some(projection) => {
                let (slot, _) = projection.track(id);
                if !slot.is_resolved() && !id.is_empty() {
                    projection.request(id);
                }
                slot
            }
            None => self.detached.get_or_insert(id).0,
        }
    }

    /// Current item for `id`, triggering resolution like [`ReferenceMap::get`].
    pub fn value(&self, id: &str) -> Option<ReferenceItem<T>> {
        self.get(id).value()
    }

    /// Metadata about the referenced resource type.
    pub fn type_info(&self) -> &ReferenceTypeInfo {
        &self.type_info
    }

    /// False when the scope required by the resource type was unresolved.
    pub fn is_enabled(&self) -> bool {
        self.projection.is_some()
    }

    /// Ids read through this map so far.
    pub fn tracked_ids(&self) -> Vec<String> {
        match &self.projection {
            Some(projection) => projection.tracked_ids(),
            None => self.detached.ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RepositoryRegistry;
    use crate::repository::RepositoryDeps;
    use crate::store::{CacheStore, InMemoryCacheStore};
    use refscope_core::{build_scoped_key, ReferenceAdaptor, ReferenceConfig, REFERENCE_VERB};
    use refscope_test_utils::{
        label_adaptor, named, project_descriptor, settle, workspace_scope, MockFetcher,
        RecordingReporter,
    };
    use serde_json::Value;

    fn attached_map(fetcher: Arc<MockFetcher>) -> (ReferenceMap<Value>, Arc<InMemoryCacheStore>) {
        let store = Arc::new(InMemoryCacheStore::new());
        let registry = RepositoryRegistry::new(RepositoryDeps::new(
            store.clone(),
            Arc::new(RecordingReporter::new()),
            ReferenceConfig::default(),
        ));
        let descriptor = project_descriptor();
        let key = build_scoped_key(&descriptor.required_tiers, &workspace_scope(), "project", REFERENCE_VERB, None)
            .resolved()
            .cloned()
            .unwrap();
        let repo = registry.get(&descriptor, &key, fetcher);
        let resolver = registry.resolver_for(&repo);
        let adaptor: Arc<dyn ReferenceAdaptor<Value>> = Arc::new(label_adaptor());
        let projection = ReferenceProjection::subscribe(repo, adaptor, resolver);
        (ReferenceMap::attached(projection, descriptor.type_info()), store)
    }

    #[tokio::test]
    async fn test_reads_in_one_pass_share_one_fetch() {
        let fetcher = Arc::new(MockFetcher::with_entities(
            "id",
            vec![named("p-1", "Alpha"), named("p-2", "Beta")],
        ));
        let (map, _) = attached_map(fetcher.clone());

        let a = map.get("p-1");
        let b = map.get("p-2");
        let a_again = map.get("p-1");
        assert!(a.ptr_eq(&a_again));
        assert!(a.value().is_none());

        settle().await;

        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(a.value().unwrap().label, "Alpha");
        assert_eq!(b.value().unwrap().label, "Beta");
        assert_eq!(map.tracked_ids().len(), 2);
    }

    #[test]
    fn test_cached_read_resolves_without_fetch() {
        let fetcher = Arc::new(MockFetcher::new("id"));
        let (map, store) = attached_map(fetcher.clone());
        let key = build_scoped_key(
            &project_descriptor().required_tiers,
            &workspace_scope(),
            "project",
            REFERENCE_VERB,
            None,
        )
        .resolved()
        .cloned()
        .unwrap();
        store.set(&key, vec![named("p-1", "Alpha")]);

        assert_eq!(map.value("p-1").unwrap().name, "Alpha");
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_map_never_fetches() {
        let map: ReferenceMap<Value> = ReferenceMap::disabled(project_descriptor().type_info());
        let slot = map.get("p-1");
        settle().await;

        assert!(!map.is_enabled());
        assert!(slot.value().is_none());
        assert!(slot.ptr_eq(&map.get("p-1")));
        assert_eq!(map.type_info().resource_type, "project");
    }

    #[tokio::test]
    async fn test_empty_id_is_never_requested() {
        let fetcher = Arc::new(MockFetcher::new("id"));
        let (map, _) = attached_map(fetcher.clone());
        assert!(map.value("").is_none());
        settle().await;
        assert_eq!(fetcher.call_count(), 0);
    }
}
