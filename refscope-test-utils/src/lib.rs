//! refscope Test Utilities
//!
//! Shared test infrastructure for the refscope workspace:
//! - A scriptable mock fetch function
//! - A recording error reporter
//! - Proptest generators for ids and entities
//! - Fixtures for common resources and scopes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Semaphore;

pub use refscope_core::{
    entity_id, ErrorReporter, ListResponse, RawEntity, RefError, RefResult, ReferenceFetcher,
    ReferenceQuery,
};

pub use fixtures::{label_adaptor, named, project_descriptor, region_descriptor, workspace_scope};
pub use generators::{arb_id, arb_id_batch};

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// In-memory backend for one resource type.
///
/// Honours the id filter of each query, records every call, and can be
/// told to fail or to block until released.
pub struct MockFetcher {
    id_key: String,
    universe: Mutex<Vec<RawEntity>>,
    calls: Mutex<Vec<ReferenceQuery>>,
    failures: AtomicUsize,
    gate: Option<Semaphore>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockFetcher {
    /// Empty backend keyed by `id_key`.
    pub fn new(id_key: impl Into<String>) -> Self {
        Self {
            id_key: id_key.into(),
            universe: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            gate: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Backend holding `entities`.
    pub fn with_entities(id_key: impl Into<String>, entities: Vec<RawEntity>) -> Self {
        let fetcher = Self::new(id_key);
        *fetcher.universe.lock().unwrap() = entities;
        fetcher
    }

    /// Block every call until [`MockFetcher::release`] hands out a permit.
    pub fn paused(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Let `n` blocked calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Insert or replace an entity by id.
    pub fn insert(&self, entity: RawEntity) {
        let id = entity_id(&entity, &self.id_key);
        let mut universe = self.universe.lock().unwrap();
        match universe
            .iter()
            .position(|e| id.is_some() && entity_id(e, &self.id_key) == id)
        {
            Some(i) => universe[i] = entity,
            None => universe.push(entity),
        }
    }

    /// Delete an entity from the backend.
    pub fn remove(&self, id: &str) {
        self.universe
            .lock()
            .unwrap()
            .retain(|e| entity_id(e, &self.id_key).as_deref() != Some(id));
    }

    pub fn calls(&self) -> Vec<ReferenceQuery> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Ids requested by each call, in call order. Unfiltered calls yield an
    /// empty list.
    pub fn requested_ids(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.requested_ids().map(<[String]>::to_vec).unwrap_or_default())
            .collect()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceFetcher for MockFetcher {
    async fn fetch(&self, query: &ReferenceQuery) -> RefResult<ListResponse> {
        self.calls.lock().unwrap().push(query.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if fail {
            Err(RefError::request_failed("mock", "injected failure"))
        } else {
            let universe = self.universe.lock().unwrap();
            let results: Vec<RawEntity> = match query.requested_ids() {
                Some(ids) => universe
                    .iter()
                    .filter(|e| {
                        entity_id(e, &self.id_key)
                            .map(|id| ids.contains(&id))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
                None => universe.clone(),
            };
            let total = results.len() as u64;
            Ok(ListResponse {
                results,
                total_count: Some(total),
            })
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// RECORDING REPORTER
// ============================================================================

/// Error reporter that keeps every report for inspection.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, RefError)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn reports(&self) -> Vec<(String, RefError)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, resource_key: &str, error: &RefError) {
        self.reports
            .lock()
            .unwrap()
            .push((resource_key.to_string(), error.clone()));
    }
}

/// Let spawned tasks on the current-thread test runtime run to quiescence.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ids and raw entities.

    use proptest::prelude::*;

    /// Generate a short entity id such as `ab-12`.
    pub fn arb_id() -> impl Strategy<Value = String> {
        "[a-z]{1,3}-[0-9]{1,3}"
    }

    /// Generate a batch of ids, possibly with repeats.
    pub fn arb_id_batch() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec(arb_id(), 0..12)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built resources, scopes and entities.

    use refscope_core::{FieldAdaptor, RawEntity, ResourceDescriptor, ScopeContext, ScopeTier};
    use serde_json::json;

    /// `{"id": id, "name": name}`
    pub fn named(id: &str, name: &str) -> RawEntity {
        json!({"id": id, "name": name})
    }

    /// Workspace-scoped `project` resource that asks only for id and name.
    pub fn project_descriptor() -> ResourceDescriptor {
        ResourceDescriptor::new("project", "id", "Project")
            .with_tiers(&[ScopeTier::Domain, ScopeTier::Workspace])
            .with_param("only", json!(["id", "name"]))
    }

    /// Domain-scoped `region` resource keyed by `region_code`.
    pub fn region_descriptor() -> ResourceDescriptor {
        ResourceDescriptor::new("region", "region_code", "Region").with_tiers(&[ScopeTier::Domain])
    }

    /// Scope with domain `d-1` and workspace `w-1` selected.
    pub fn workspace_scope() -> ScopeContext {
        ScopeContext::new().with_domain("d-1").with_workspace("w-1")
    }

    /// Adaptor labelling entities by their `name` field.
    pub fn label_adaptor() -> FieldAdaptor {
        FieldAdaptor::new("id", "name")
    }
}

// ============================================================================
// TESTS
// ============================================================================
