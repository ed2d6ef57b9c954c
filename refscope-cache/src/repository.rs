//! Repository: the single owner of one reference cache entry.
//!
//! A repository is identified by (resource key, cache key). It coalesces
//! every `request_item` issued within one scheduler tick into a single
//! batched fetch, serializes its own fetch cycles, and upserts results into
//! the shared store by id.
//!
//! # State machine
//!
//! ```text
//! Created ──request_item──▶ Pending ──flush──▶ Fetching ──ok──▶ Idle (entry updated)
//!                              ▲                    └──err──▶ Idle (entry unchanged, markers cleared)
//!                              └────────request_item────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use refscope_core::{
    entity_id, CacheKey, ErrorReporter, ListResponse, MutationError, RawEntity, RefResult,
    ReferenceConfig, ReferenceFetcher, ReferenceQuery, ResourceDescriptor,
};
use refscope_events::Topic;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::store::{CacheStore, StoreListener, StoreSubscriptionId};

/// Observable lifecycle phase of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryPhase {
    /// No id has been requested yet.
    Created,
    /// Ids are queued and a flush is scheduled.
    Pending,
    /// A fetch is in flight.
    Fetching,
    /// Nothing queued, nothing in flight.
    Idle,
}

/// Collaborators shared by every repository of one registry.
#[derive(Clone)]
pub struct RepositoryDeps {
    pub store: Arc<dyn CacheStore>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub config: ReferenceConfig,
    /// Global fetch cap, shared across repositories.
    pub limiter: Option<Arc<Semaphore>>,
}

impl RepositoryDeps {
    /// Build deps, creating the fetch limiter from `config`.
    pub fn new(
        store: Arc<dyn CacheStore>,
        reporter: Arc<dyn ErrorReporter>,
        config: ReferenceConfig,
    ) -> Self {
        let limiter = config
            .max_concurrent_fetches
            .map(|max| Arc::new(Semaphore::new(max)));
        Self {
            store,
            reporter,
            config,
            limiter,
        }
    }
}

/// Insertion-ordered id set.
#[derive(Debug, Default)]
struct IdQueue {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl IdQueue {
    fn insert(&mut self, id: &str) -> bool {
        if self.members.insert(id.to_string()) {
            self.order.push_back(id.to_string());
            true
        } else {
            false
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.members.remove(id) {
            self.order.retain(|queued| queued != id);
            true
        } else {
            false
        }
    }

    fn take(&mut self, max: usize) -> Vec<String> {
        let n = max.min(self.order.len());
        let taken: Vec<String> = self.order.drain(..n).collect();
        for id in &taken {
            self.members.remove(id);
        }
        taken
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn to_vec(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct RepositoryState {
    phase: RepositoryPhase,
    /// Uncached ids waiting for the next flush.
    pending: IdQueue,
    /// Cached ids queued for re-fetch by a refresh.
    reloading: IdQueue,
    /// Ids covered by the fetch currently in flight.
    in_flight: HashSet<String>,
    /// Ids omitted from a successful fetch, with when that happened.
    missing: HashMap<String, DateTime<Utc>>,
    flush_scheduled: bool,
    fetching: bool,
    preloaded_at: Option<DateTime<Utc>>,
}

impl Default for RepositoryState {
    fn default() -> Self {
        Self {
            phase: RepositoryPhase::Created,
            pending: IdQueue::default(),
            reloading: IdQueue::default(),
            in_flight: HashSet::new(),
            missing: HashMap::new(),
            flush_scheduled: false,
            fetching: false,
            preloaded_at: None,
        }
    }
}

/// Id positions over one snapshot of the cache entry.
pub(crate) struct EntryIndex {
    entries: Arc<Vec<RawEntity>>,
    positions: HashMap<String, usize>,
}

impl EntryIndex {
    fn build(entries: Arc<Vec<RawEntity>>, id_key: &str) -> Self {
        let mut positions = HashMap::with_capacity(entries.len());
        for (i, entity) in entries.iter().enumerate() {
            if let Some(id) = entity_id(entity, id_key) {
                positions.entry(id).or_insert(i);
            }
        }
        Self { entries, positions }
    }

    pub(crate) fn get(&self, id: &str) -> Option<&RawEntity> {
        self.positions.get(id).map(|&i| &self.entries[i])
    }

    fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }
}

fn elapsed_since(at: DateTime<Utc>) -> Duration {
    Utc::now()
        .signed_duration_since(at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Owner of one reference cache entry.
///
/// Obtain shared instances through [`crate::RepositoryRegistry`]; constructing
/// one directly bypasses registry deduplication.
pub struct Repository {
    descriptor: Arc<ResourceDescriptor>,
    key: CacheKey,
    topic: Topic,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn ReferenceFetcher>,
    reporter: Arc<dyn ErrorReporter>,
    config: ReferenceConfig,
    limiter: Option<Arc<Semaphore>>,
    /// Serializes fetches issued by this repository.
    fetch_gate: tokio::sync::Mutex<()>,
    state: Mutex<RepositoryState>,
    /// Rebuilt whenever the store hands out a different entry snapshot.
    index: Mutex<Option<Arc<EntryIndex>>>,
}

impl Repository {
    /// Create a repository for `key`.
    pub fn new(
        descriptor: Arc<ResourceDescriptor>,
        key: CacheKey,
        fetcher: Arc<dyn ReferenceFetcher>,
        deps: RepositoryDeps,
    ) -> Arc<Self> {
        let topic = Topic::new(descriptor.resource_key.as_str());
        Arc::new(Self {
            descriptor,
            key,
            topic,
            store: deps.store,
            fetcher,
            reporter: deps.reporter,
            config: deps.config,
            limiter: deps.limiter,
            fetch_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(RepositoryState::default()),
            index: Mutex::new(None),
        })
    }

    /// The cache key this repository owns.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The wake-up topic for this repository.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn resource_key(&self) -> &str {
        &self.descriptor.resource_key
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> RepositoryPhase {
        self.state().phase
    }

    /// Snapshot of the cache entry.
    pub fn entries(&self) -> Arc<Vec<RawEntity>> {
        self.store.get(&self.key).unwrap_or_default()
    }

    /// Cached entity for `id`.
    pub fn get(&self, id: &str) -> Option<RawEntity> {
        self.indexed().and_then(|index| index.get(id).cloned())
    }

    /// True if the cache entry holds `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.indexed().map(|index| index.contains(id)).unwrap_or(false)
    }

    /// Id index over the current entry, or `None` if nothing is cached.
    pub(crate) fn indexed(&self) -> Option<Arc<EntryIndex>> {
        let entries = self.store.get(&self.key)?;
        let mut cached = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = cached.as_ref() {
            if Arc::ptr_eq(&index.entries, &entries) {
                return Some(Arc::clone(index));
            }
        }
        let index = Arc::new(EntryIndex::build(entries, &self.descriptor.id_key));
        *cached = Some(Arc::clone(&index));
        Some(index)
    }

    /// Ids waiting for the next flush, in request order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.state().pending.to_vec()
    }

    /// True if `id` was omitted from a fetch and is not yet requestable again.
    pub fn is_missing(&self, id: &str) -> bool {
        let st = self.state();
        self.missing_blocks(&st, id)
    }

    /// Listen to changes of the cache entry.
    pub fn subscribe(&self, listener: StoreListener) -> StoreSubscriptionId {
        self.store.subscribe(&self.key, listener)
    }

    pub fn unsubscribe(&self, id: StoreSubscriptionId) -> bool {
        self.store.unsubscribe(&self.key, id)
    }

    /// Queue `id` for the next batched fetch.
    ///
    /// No-op if the id is cached, already pending or in flight, or was
    /// reported missing and the not-found policy still holds it back.
    /// Returns true if the id was queued.
    pub fn request_item(self: &Arc<Self>, id: &str) -> bool {
        if id.is_empty() || self.contains(id) {
            trace!(resource_key = self.resource_key(), id = id, "Request served from cache");
            return false;
        }

        let schedule = {
            let mut st = self.state();
            if st.pending.contains(id) || st.in_flight.contains(id) || self.missing_blocks(&st, id) {
                return false;
            }
            st.missing.remove(id);
            st.pending.insert(id);
            if !st.fetching {
                st.phase = RepositoryPhase::Pending;
            }
            if st.fetching || st.flush_scheduled {
                false
            } else {
                st.flush_scheduled = true;
                true
            }
        };

        trace!(resource_key = self.resource_key(), id = id, "Queued reference request");
        if schedule {
            self.schedule_flush();
        }
        true
    }

    /// Re-fetch every cached and missing id.
    ///
    /// Cached data stays visible until the re-fetch lands; cached ids the
    /// backend no longer returns are then removed from the entry.
    pub fn refresh(self: &Arc<Self>) {
        let cached: Vec<String> = self
            .entries()
            .iter()
            .filter_map(|e| entity_id(e, &self.descriptor.id_key))
            .collect();
        self.store.invalidate_where(&|k: &CacheKey| k == &self.key);

        let (queued, schedule) = {
            let mut st = self.state();
            let missing: Vec<String> = st.missing.drain().map(|(id, _)| id).collect();
            let mut queued = 0usize;
            for id in &cached {
                if st.reloading.insert(id) {
                    queued += 1;
                }
            }
            for id in &missing {
                if !st.in_flight.contains(id) && st.pending.insert(id) {
                    queued += 1;
                }
            }
            if queued == 0 {
                (0, false)
            } else {
                if !st.fetching {
                    st.phase = RepositoryPhase::Pending;
                }
                let schedule = !st.fetching && !st.flush_scheduled;
                if schedule {
                    st.flush_scheduled = true;
                }
                (queued, schedule)
            }
        };

        info!(
            resource_key = self.resource_key(),
            cache_key = %self.key,
            count = queued,
            "Refreshing reference entry"
        );
        if schedule {
            self.schedule_flush();
        }
    }

    /// Run flush cycles until nothing is queued.
    ///
    /// Normally driven by the scheduled task; returns immediately if a fetch
    /// is already in flight, since that cycle's owner picks up new ids.
    pub async fn flush(self: &Arc<Self>) {
        loop {
            let (batch, reloads) = {
                let mut st = self.state();
                st.flush_scheduled = false;
                if st.fetching {
                    return;
                }
                if st.pending.is_empty() && st.reloading.is_empty() {
                    if st.phase == RepositoryPhase::Pending {
                        st.phase = RepositoryPhase::Idle;
                    }
                    return;
                }

                let max = self.config.max_batch_size.max(1);
                let mut batch = st.pending.take(max);
                let reload_ids = st.reloading.take(max - batch.len());
                let reloads: HashSet<String> = reload_ids.iter().cloned().collect();
                batch.extend(reload_ids);

                st.in_flight.extend(batch.iter().cloned());
                st.fetching = true;
                st.phase = RepositoryPhase::Fetching;
                (batch, reloads)
            };

            self.fetch_batch(&batch, &reloads).await;

            let mut st = self.state();
            st.fetching = false;
            for id in &batch {
                st.in_flight.remove(id);
            }
            if st.pending.is_empty() && st.reloading.is_empty() {
                st.phase = RepositoryPhase::Idle;
                return;
            }
        }
    }

    /// Load every entity visible to the base params, replacing the entry.
    ///
    /// Skipped while the previous preload is younger than the configured
    /// preload TTL, unless `force` is set. Returns the number of entities
    /// loaded (zero when skipped).
    pub async fn preload(self: &Arc<Self>, force: bool) -> RefResult<usize> {
        let last = self.state().preloaded_at;
        if let Some(at) = last {
            if !force && elapsed_since(at) < self.config.preload_ttl {
                debug!(resource_key = self.resource_key(), "Preload still fresh, skipping");
                return Ok(0);
            }
        }

        let query = ReferenceQuery::all(self.descriptor.base_params.clone());
        let response = match self.fetch_gated(&query).await {
            Ok(response) => response,
            Err(err) => {
                self.reporter.report(self.resource_key(), &err);
                return Err(err);
            }
        };

        let mut loaded = Vec::with_capacity(response.results.len());
        let mut ids = Vec::with_capacity(response.results.len());
        for entity in response.results {
            match entity_id(&entity, &self.descriptor.id_key) {
                Some(id) => {
                    ids.push(id);
                    loaded.push(entity);
                }
                None => warn!(
                    resource_key = self.resource_key(),
                    id_key = %self.descriptor.id_key,
                    "Dropping preloaded entity without id"
                ),
            }
        }
        let count = loaded.len();
        self.store.set(&self.key, loaded);

        let mut st = self.state();
        st.preloaded_at = Some(Utc::now());
        st.missing.clear();
        for id in &ids {
            st.pending.remove(id);
        }
        info!(resource_key = self.resource_key(), cache_key = %self.key, count = count, "Preloaded references");
        Ok(count)
    }

    /// Upsert one entity returned by a mutation. Returns its id.
    pub(crate) fn patch(&self, entity: RawEntity) -> Result<String, MutationError> {
        let id = entity_id(&entity, &self.descriptor.id_key).ok_or_else(|| MutationError::MissingId {
            resource_key: self.descriptor.resource_key.clone(),
            id_key: self.descriptor.id_key.clone(),
        })?;
        self.apply_results(vec![entity], &HashSet::new());
        debug!(resource_key = self.resource_key(), id = %id, "Patched reference entry");
        Ok(id)
    }

    fn state(&self) -> MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn missing_blocks(&self, st: &RepositoryState, id: &str) -> bool {
        match st.missing.get(id) {
            None => false,
            Some(at) => match self.config.missing_retry_after {
                None => true,
                Some(after) => elapsed_since(*at) < after,
            },
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    resource_key = self.resource_key(),
                    "No async runtime available; reference flush not scheduled"
                );
                self.state().flush_scheduled = false;
                return;
            }
        };

        let repo = Arc::clone(self);
        let delay = self.config.flush_delay;
        handle.spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            repo.flush().await;
        });
    }

    async fn fetch_gated(&self, query: &ReferenceQuery) -> RefResult<ListResponse> {
        let _gate = self.fetch_gate.lock().await;
        let _permit = match &self.limiter {
            Some(limiter) => Arc::clone(limiter).acquire_owned().await.ok(),
            None => None,
        };
        self.fetcher.fetch(query).await
    }

    async fn fetch_batch(&self, ids: &[String], reloads: &HashSet<String>) {
        let query = ReferenceQuery::for_ids(
            &self.descriptor.id_key,
            ids.to_vec(),
            self.descriptor.base_params.clone(),
        );
        debug!(
            resource_key = self.resource_key(),
            cache_key = %self.key,
            count = ids.len(),
            "Fetching reference batch"
        );

        match self.fetch_gated(&query).await {
            Ok(response) => {
                let found = self.apply_results(response.results, reloads);
                let now = Utc::now();
                let mut st = self.state();
                let mut missing = 0usize;
                for id in ids {
                    if !found.contains(id) {
                        st.missing.insert(id.clone(), now);
                        missing += 1;
                    }
                }
                debug!(
                    resource_key = self.resource_key(),
                    found = ids.len() - missing,
                    missing = missing,
                    "Reference batch applied"
                );
            }
            Err(err) => {
                // Markers for this batch are cleared by the caller, so a later
                // request_item can retry.
                self.reporter.report(self.resource_key(), &err);
            }
        }
    }

    /// Upsert `results` by id; ids in `reloads` that are absent from
    /// `results` are removed. Returns the ids present in `results`.
    ///
    /// A stale entry stays stale while reloads are still queued, so a
    /// refresh split over several batches is only fresh once all have landed.
    fn apply_results(&self, results: Vec<RawEntity>, reloads: &HashSet<String>) -> HashSet<String> {
        let id_key = self.descriptor.id_key.as_str();
        let mut incoming: Vec<(String, RawEntity)> = Vec::with_capacity(results.len());
        for entity in results {
            match entity_id(&entity, id_key) {
                Some(id) => incoming.push((id, entity)),
                None => warn!(
                    resource_key = self.resource_key(),
                    id_key = id_key,
                    "Dropping fetched entity without id"
                ),
            }
        }
        let found: HashSet<String> = incoming.iter().map(|(id, _)| id.clone()).collect();
        let stale = self.store.is_stale(&self.key);
        let reloads_queued = !self.state().reloading.is_empty();
        let keep_stale = stale && reloads_queued;

        let mut apply = |current: &[RawEntity]| -> Option<Vec<RawEntity>> {
            let mut next = current.to_vec();
            let mut changed = false;

            if !reloads.is_empty() {
                let before = next.len();
                next.retain(|e| match entity_id(e, id_key) {
                    Some(id) => !reloads.contains(&id) || found.contains(&id),
                    None => true,
                });
                changed |= next.len() != before;
            }

            let mut index: HashMap<String, usize> = next
                .iter()
                .enumerate()
                .filter_map(|(i, e)| entity_id(e, id_key).map(|id| (id, i)))
                .collect();
            for (id, entity) in &incoming {
                match index.get(id) {
                    Some(&i) => {
                        if next[i] != *entity {
                            next[i] = entity.clone();
                            changed = true;
                        }
                    }
                    None => {
                        index.insert(id.clone(), next.len());
                        next.push(entity.clone());
                        changed = true;
                    }
                }
            }

            (changed || (stale && !keep_stale)).then_some(next)
        };
        if keep_stale {
            self.store.update_keeping_stale(&self.key, &mut apply);
        } else {
            self.store.update(&self.key, &mut apply);
        }

        let mut st = self.state();
        for id in &found {
            st.pending.remove(id);
            st.missing.remove(id);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCacheStore;
    use refscope_core::{build_scoped_key, ScopeContext, ScopeTier};
    use refscope_test_utils::{named, project_descriptor, settle, MockFetcher, RecordingReporter};
    use serde_json::json;

    struct Fixture {
        repo: Arc<Repository>,
        fetcher: Arc<MockFetcher>,
        reporter: Arc<RecordingReporter>,
        store: Arc<InMemoryCacheStore>,
    }

    fn fixture_with(fetcher: MockFetcher, config: ReferenceConfig) -> Fixture {
        let descriptor = Arc::new(project_descriptor());
        let ctx = ScopeContext::new().with_domain("d-1").with_workspace("w-1");
        let key = build_scoped_key(
            &[ScopeTier::Domain, ScopeTier::Workspace],
            &ctx,
            "project",
            "reference",
            None,
        )
        .resolved()
        .cloned()
        .unwrap();

        let fetcher = Arc::new(fetcher);
        let reporter = Arc::new(RecordingReporter::new());
        let store = Arc::new(InMemoryCacheStore::new());
        let deps = RepositoryDeps::new(store.clone(), reporter.clone(), config);
        let repo = Repository::new(descriptor, key, fetcher.clone(), deps);
        Fixture {
            repo,
            fetcher,
            reporter,
            store,
        }
    }

    fn fixture(fetcher: MockFetcher) -> Fixture {
        fixture_with(fetcher, ReferenceConfig::default())
    }

    #[tokio::test]
    async fn test_requests_in_one_pass_coalesce_into_one_fetch() {
        let fx = fixture(MockFetcher::with_entities("id", vec![named("p-1", "Alpha")]));

        assert_eq!(fx.repo.phase(), RepositoryPhase::Created);
        assert!(fx.repo.request_item("p-1"));
        assert!(fx.repo.request_item("p-2"));
        assert_eq!(fx.repo.phase(), RepositoryPhase::Pending);
        assert_eq!(fx.fetcher.call_count(), 0);

        settle().await;

        assert_eq!(fx.fetcher.requested_ids(), vec![vec!["p-1".to_string(), "p-2".to_string()]]);
        assert!(fx.repo.contains("p-1"));
        assert!(!fx.repo.contains("p-2"));
        assert_eq!(fx.repo.phase(), RepositoryPhase::Idle);
    }

    #[tokio::test]
    async fn test_cached_id_never_fetches() {
        let fx = fixture(MockFetcher::new("id"));
        fx.store.set(fx.repo.key(), vec![named("p-1", "Alpha")]);

        assert!(!fx.repo.request_item("p-1"));
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_requests_are_deduplicated() {
        let fx = fixture(MockFetcher::with_entities("id", vec![named("p-1", "Alpha")]));

        assert!(fx.repo.request_item("p-1"));
        assert!(!fx.repo.request_item("p-1"));
        assert_eq!(fx.repo.pending_ids(), vec!["p-1".to_string()]);
        settle().await;

        assert_eq!(fx.fetcher.requested_ids(), vec![vec!["p-1".to_string()]]);
    }

    #[tokio::test]
    async fn test_requests_during_flight_wait_for_next_cycle() {
        let fetcher = MockFetcher::with_entities("id", vec![named("p-1", "Alpha"), named("p-2", "Beta")]).paused();
        let fx = fixture(fetcher);

        fx.repo.request_item("p-1");
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 1);
        assert_eq!(fx.repo.phase(), RepositoryPhase::Fetching);

        // p-1 is in flight, p-2 is new
        assert!(!fx.repo.request_item("p-1"));
        assert!(fx.repo.request_item("p-2"));
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 1);

        fx.fetcher.release(1);
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 2);
        fx.fetcher.release(1);
        settle().await;

        assert_eq!(
            fx.fetcher.requested_ids(),
            vec![vec!["p-1".to_string()], vec!["p-2".to_string()]]
        );
        assert_eq!(fx.fetcher.max_concurrent(), 1);
        assert!(fx.repo.contains("p-1"));
        assert!(fx.repo.contains("p-2"));
        assert_eq!(fx.repo.phase(), RepositoryPhase::Idle);
    }

    #[tokio::test]
    async fn test_failure_clears_markers_and_allows_retry() {
        let fx = fixture(MockFetcher::with_entities("id", vec![named("p-1", "Alpha")]));
        fx.fetcher.fail_next(1);

        fx.repo.request_item("p-1");
        settle().await;

        assert_eq!(fx.reporter.count(), 1);
        assert!(fx.repo.entries().is_empty());
        assert!(fx.repo.pending_ids().is_empty());
        assert_eq!(fx.repo.phase(), RepositoryPhase::Idle);

        assert!(fx.repo.request_item("p-1"));
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 2);
        assert!(fx.repo.contains("p-1"));
    }

    #[tokio::test]
    async fn test_missing_ids_are_not_retried_by_default() {
        let fx = fixture(MockFetcher::new("id"));

        fx.repo.request_item("ghost");
        settle().await;
        assert!(fx.repo.is_missing("ghost"));

        assert!(!fx.repo.request_item("ghost"));
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_ids_retry_after_configured_window() {
        let config = ReferenceConfig::default().with_missing_retry_after(Duration::ZERO);
        let fx = fixture_with(MockFetcher::new("id"), config);

        fx.repo.request_item("ghost");
        settle().await;
        fx.fetcher.insert(named("ghost", "Found later"));

        assert!(fx.repo.request_item("ghost"));
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 2);
        assert!(fx.repo.contains("ghost"));
        assert!(!fx.repo.is_missing("ghost"));
    }

    #[tokio::test]
    async fn test_batches_are_split_by_max_batch_size() {
        let config = ReferenceConfig::default().with_max_batch_size(2);
        let fx = fixture_with(MockFetcher::new("id"), config);

        for id in ["a", "b", "c"] {
            fx.repo.request_item(id);
        }
        settle().await;

        assert_eq!(
            fx.fetcher.requested_ids(),
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_uses_base_params() {
        let fx = fixture(MockFetcher::new("id"));
        fx.repo.request_item("p-1");
        settle().await;

        let call = &fx.fetcher.calls()[0];
        assert_eq!(call.params.get("only"), Some(&json!(["id", "name"])));
        assert_eq!(call.filter[0].k, "id");
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let fx = fixture(MockFetcher::new("id"));
        let results = vec![named("p-1", "Alpha"), named("p-2", "Beta")];

        fx.repo.apply_results(results.clone(), &HashSet::new());
        let once = fx.repo.entries();
        fx.repo.apply_results(results, &HashSet::new());
        let twice = fx.repo.entries();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let fx = fixture(MockFetcher::new("id"));
        fx.repo.apply_results(vec![named("p-1", "Alpha")], &HashSet::new());
        fx.repo.apply_results(vec![named("p-1", "Alpha v2")], &HashSet::new());

        assert_eq!(fx.repo.entries().as_slice(), &[named("p-1", "Alpha v2")]);
    }

    #[test]
    fn test_request_without_runtime_does_not_panic() {
        let fx = fixture(MockFetcher::new("id"));
        assert!(fx.repo.request_item("p-1"));
        assert_eq!(fx.repo.pending_ids(), vec!["p-1".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_reconciles_cached_ids() {
        let fx = fixture(MockFetcher::with_entities(
            "id",
            vec![named("p-1", "Alpha"), named("p-2", "Beta")],
        ));
        fx.repo.request_item("p-1");
        fx.repo.request_item("p-2");
        settle().await;
        assert_eq!(fx.repo.entries().len(), 2);

        fx.fetcher.insert(named("p-1", "Alpha renamed"));
        fx.fetcher.remove("p-2");
        fx.repo.refresh();
        assert!(fx.store.is_stale(fx.repo.key()));
        settle().await;

        assert_eq!(fx.repo.entries().as_slice(), &[named("p-1", "Alpha renamed")]);
        assert!(!fx.store.is_stale(fx.repo.key()));
    }

    #[tokio::test]
    async fn test_refresh_retries_missing_ids() {
        let fx = fixture(MockFetcher::new("id"));
        fx.repo.request_item("p-9");
        settle().await;
        assert!(fx.repo.is_missing("p-9"));

        fx.fetcher.insert(named("p-9", "Late"));
        fx.repo.refresh();
        settle().await;
        assert!(fx.repo.contains("p-9"));
    }

    #[tokio::test]
    async fn test_preload_respects_ttl_unless_forced() {
        let fx = fixture(MockFetcher::with_entities(
            "id",
            vec![named("p-1", "Alpha"), named("p-2", "Beta")],
        ));

        assert_eq!(fx.repo.preload(false).await.unwrap(), 2);
        assert_eq!(fx.repo.preload(false).await.unwrap(), 0);
        assert_eq!(fx.fetcher.call_count(), 1);
        assert!(fx.fetcher.calls()[0].filter.is_empty());

        assert_eq!(fx.repo.preload(true).await.unwrap(), 2);
        assert_eq!(fx.fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_preload_failure_is_reported_and_returned() {
        let fx = fixture(MockFetcher::new("id"));
        fx.fetcher.fail_next(1);

        assert!(fx.repo.preload(true).await.is_err());
        assert_eq!(fx.reporter.count(), 1);
        assert!(fx.repo.entries().is_empty());
    }

    #[test]
    fn test_patch_requires_id() {
        let fx = fixture(MockFetcher::new("id"));
        let err = fx.repo.patch(json!({"name": "no id"})).unwrap_err();
        assert!(matches!(err, MutationError::MissingId { .. }));

        assert_eq!(fx.repo.patch(named("p-3", "Gamma")).unwrap(), "p-3");
        assert!(fx.repo.contains("p-3"));
    }

    #[test]
    fn test_lookup_follows_entry_writes() {
        let fx = fixture(MockFetcher::new("id"));
        assert!(fx.repo.indexed().is_none());
        assert!(!fx.repo.contains("p-1"));

        fx.store.set(fx.repo.key(), vec![named("p-1", "Alpha")]);
        let first = fx.repo.indexed().unwrap();
        assert!(Arc::ptr_eq(&first, &fx.repo.indexed().unwrap()));
        assert!(fx.repo.contains("p-1"));

        fx.store.set(fx.repo.key(), vec![named("p-2", "Beta")]);
        assert!(!fx.repo.contains("p-1"));
        assert_eq!(fx.repo.get("p-2"), Some(named("p-2", "Beta")));
        assert!(!Arc::ptr_eq(&first, &fx.repo.indexed().unwrap()));
    }

    #[tokio::test]
    async fn test_split_refresh_stays_stale_until_last_batch() {
        let config = ReferenceConfig::default().with_max_batch_size(1);
        let fetcher = MockFetcher::new("id").paused();
        let fx = fixture_with(fetcher, config);
        fx.repo
            .apply_results(vec![named("p-1", "Alpha"), named("p-2", "Beta")], &HashSet::new());
        fx.fetcher.insert(named("p-1", "Alpha v2"));
        fx.fetcher.insert(named("p-2", "Beta v2"));

        fx.repo.refresh();
        settle().await;
        assert_eq!(fx.fetcher.requested_ids(), vec![vec!["p-1".to_string()]]);

        fx.fetcher.release(1);
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 2);
        assert_eq!(fx.repo.get("p-1"), Some(named("p-1", "Alpha v2")));
        assert!(fx.store.is_stale(fx.repo.key()));

        fx.fetcher.release(1);
        settle().await;
        assert_eq!(fx.repo.get("p-2"), Some(named("p-2", "Beta v2")));
        assert!(!fx.store.is_stale(fx.repo.key()));
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_shared() {
        let config = ReferenceConfig::default().with_max_concurrent_fetches(1);
        let fx = fixture_with(MockFetcher::new("id"), config);
        assert!(fx.repo.limiter.is_some());

        fx.repo.request_item("p-1");
        settle().await;
        assert_eq!(fx.fetcher.call_count(), 1);
        assert_eq!(fx.repo.limiter.as_ref().unwrap().available_permits(), 1);
    }
}
