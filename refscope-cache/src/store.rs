//! Shared cache store: the keyed reactive substrate repositories persist into.
//!
//! The store is an external collaborator in production (it may evict data at
//! any time); [`InMemoryCacheStore`] is the default implementation and the
//! one used by tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use refscope_core::{CacheKey, RawEntity};
use tracing::debug;

/// Change notification delivered to store subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The entry under the key was written.
    Updated(Arc<Vec<RawEntity>>),
    /// The entry was marked stale and should be re-fetched on next read.
    Invalidated,
    /// The entry was evicted.
    Removed,
}

/// Listener for one key.
pub type StoreListener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Token returned by [`CacheStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreSubscriptionId(u64);

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of keys holding data.
    pub entry_count: u64,
    /// Number of keys currently marked stale.
    pub stale_count: u64,
    /// Number of registered listeners across all keys.
    pub listener_count: u64,
}

/// Keyed reactive store.
///
/// All operations are synchronous. Listeners are invoked after the write has
/// landed and without any internal lock held, so a listener may read the
/// store again.
pub trait CacheStore: Send + Sync {
    /// Current entry under `key`.
    fn get(&self, key: &CacheKey) -> Option<Arc<Vec<RawEntity>>>;

    /// Replace the entry under `key`, clearing its stale flag.
    fn set(&self, key: &CacheKey, entries: Vec<RawEntity>);

    /// Atomically derive a new entry from the current one.
    ///
    /// `apply` sees the current entries (empty if absent) and returns
    /// `Some(next)` to write or `None` to leave the entry untouched.
    /// A write clears the stale flag. Returns true if a write happened.
    fn update(
        &self,
        key: &CacheKey,
        apply: &mut dyn FnMut(&[RawEntity]) -> Option<Vec<RawEntity>>,
    ) -> bool;

    /// Like [`CacheStore::update`], but a write leaves the stale flag as it
    /// was.
    fn update_keeping_stale(
        &self,
        key: &CacheKey,
        apply: &mut dyn FnMut(&[RawEntity]) -> Option<Vec<RawEntity>>,
    ) -> bool;

    /// Evict `key`. Returns true if an entry existed.
    fn remove(&self, key: &CacheKey) -> bool;

    /// Register a listener for changes under `key`.
    fn subscribe(&self, key: &CacheKey, listener: StoreListener) -> StoreSubscriptionId;

    /// Remove a listener. Returns true if it was registered.
    fn unsubscribe(&self, key: &CacheKey, id: StoreSubscriptionId) -> bool;

    /// Mark every stored key matching `predicate` stale. Returns the count.
    fn invalidate_where(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> u64;

    /// True if `key` holds data that was invalidated and not rewritten since.
    fn is_stale(&self, key: &CacheKey) -> bool;

    /// Get store statistics.
    fn stats(&self) -> StoreStats;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entries: Arc<Vec<RawEntity>>,
    stale: bool,
}

impl StoredEntry {
    fn new(entries: Vec<RawEntity>, stale: bool) -> Self {
        Self {
            entries: Arc::new(entries),
            stale,
        }
    }
}

/// In-memory cache store. Never evicts on its own.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<CacheKey, StoredEntry>,
    listeners: DashMap<CacheKey, Vec<(StoreSubscriptionId, StoreListener)>>,
    next_id: AtomicU64,
}

impl InMemoryCacheStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(
        &self,
        key: &CacheKey,
        apply: &mut dyn FnMut(&[RawEntity]) -> Option<Vec<RawEntity>>,
        keep_stale: bool,
    ) -> bool {
        let written = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match apply(&occupied.get().entries) {
                Some(next) => {
                    let stale = keep_stale && occupied.get().stale;
                    *occupied.get_mut() = StoredEntry::new(next, stale);
                    Some(Arc::clone(&occupied.get().entries))
                }
                None => None,
            },
            Entry::Vacant(vacant) => match apply(&[]) {
                Some(next) => {
                    let stored = vacant.insert(StoredEntry::new(next, false));
                    Some(Arc::clone(&stored.entries))
                }
                None => None,
            },
        };

        match written {
            Some(entries) => {
                self.notify(key, StoreEvent::Updated(entries));
                true
            }
            None => false,
        }
    }

    fn notify(&self, key: &CacheKey, event: StoreEvent) {
        let snapshot: Vec<StoreListener> = match self.listeners.get(key) {
            Some(registered) => registered.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in snapshot {
            listener(&event);
        }
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &CacheKey) -> Option<Arc<Vec<RawEntity>>> {
        self.entries.get(key).map(|e| Arc::clone(&e.entries))
    }

    fn set(&self, key: &CacheKey, entries: Vec<RawEntity>) {
        let mut next = Some(entries);
        self.update(key, &mut |_: &[RawEntity]| next.take());
    }

    fn update(
        &self,
        key: &CacheKey,
        apply: &mut dyn FnMut(&[RawEntity]) -> Option<Vec<RawEntity>>,
    ) -> bool {
        self.write(key, apply, false)
    }

    fn update_keeping_stale(
        &self,
        key: &CacheKey,
        apply: &mut dyn FnMut(&[RawEntity]) -> Option<Vec<RawEntity>>,
    ) -> bool {
        self.write(key, apply, true)
    }

    fn remove(&self, key: &CacheKey) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            debug!(cache_key = %key, "Evicted cache entry");
            self.notify(key, StoreEvent::Removed);
        }
        existed
    }

    fn subscribe(&self, key: &CacheKey, listener: StoreListener) -> StoreSubscriptionId {
        let id = StoreSubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(key.clone())
            .or_default()
            .push((id, listener));
        id
    }

    fn unsubscribe(&self, key: &CacheKey, id: StoreSubscriptionId) -> bool {
        let (removed, now_empty) = match self.listeners.get_mut(key) {
            Some(mut registered) => {
                let before = registered.len();
                registered.retain(|(registered_id, _)| *registered_id != id);
                (registered.len() != before, registered.is_empty())
            }
            None => (false, false),
        };
        if now_empty {
            self.listeners.remove_if(key, |_, registered| registered.is_empty());
        }
        removed
    }

    fn invalidate_where(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> u64 {
        let mut invalidated = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if predicate(entry.key()) {
                entry.value_mut().stale = true;
                invalidated.push(entry.key().clone());
            }
        }
        for key in &invalidated {
            self.notify(key, StoreEvent::Invalidated);
        }
        invalidated.len() as u64
    }

    fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries.get(key).map(|e| e.stale).unwrap_or(false)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            entry_count: self.entries.len() as u64,
            stale_count: self.entries.iter().filter(|e| e.stale).count() as u64,
            listener_count: self.listeners.iter().map(|l| l.len() as u64).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refscope_core::{build_scoped_key, ScopeContext, ScopeTier};
    use serde_json::json;
    use std::sync::Mutex;

    fn key(verb: &str) -> CacheKey {
        let ctx = ScopeContext::new().with_domain("d-1");
        build_scoped_key(&[ScopeTier::Domain], &ctx, "project", verb, None)
            .resolved()
            .cloned()
            .unwrap()
    }

    fn recording_listener() -> (Arc<Mutex<Vec<StoreEvent>>>, StoreListener) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: StoreListener = Arc::new(move |e: &StoreEvent| sink.lock().unwrap().push(e.clone()));
        (events, listener)
    }

    #[test]
    fn test_set_and_get() {
        let store = InMemoryCacheStore::new();
        assert!(store.get(&key("reference")).is_none());

        store.set(&key("reference"), vec![json!({"id": "p-1"})]);
        let entries = store.get(&key("reference")).unwrap();
        assert_eq!(entries.as_slice(), &[json!({"id": "p-1"})]);
    }

    #[test]
    fn test_update_none_leaves_entry_untouched() {
        let store = InMemoryCacheStore::new();
        let (events, listener) = recording_listener();
        store.subscribe(&key("reference"), listener);

        let written = store.update(&key("reference"), &mut |_: &[RawEntity]| None);
        assert!(!written);
        assert!(store.get(&key("reference")).is_none());
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listeners_receive_updates_for_their_key_only() {
        let store = InMemoryCacheStore::new();
        let (events, listener) = recording_listener();
        store.subscribe(&key("reference"), listener);

        store.set(&key("list"), vec![json!({"id": "x"})]);
        store.set(&key("reference"), vec![json!({"id": "p-1"})]);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StoreEvent::Updated(e) if e.len() == 1));
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = InMemoryCacheStore::new();
        let (events, listener) = recording_listener();
        let id = store.subscribe(&key("reference"), listener);

        assert!(store.unsubscribe(&key("reference"), id));
        assert!(!store.unsubscribe(&key("reference"), id));
        store.set(&key("reference"), vec![]);
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(store.stats().listener_count, 0);
    }

    #[test]
    fn test_invalidate_where_marks_stale_until_rewritten() {
        let store = InMemoryCacheStore::new();
        store.set(&key("list"), vec![json!({"id": "p-1"})]);
        store.set(&key("count"), vec![json!(1)]);

        let count = store.invalidate_where(&|k: &CacheKey| k.verb() == "count");
        assert_eq!(count, 1);
        assert!(store.is_stale(&key("count")));
        assert!(!store.is_stale(&key("list")));
        assert_eq!(store.stats().stale_count, 1);

        store.set(&key("count"), vec![json!(2)]);
        assert!(!store.is_stale(&key("count")));
    }

    #[test]
    fn test_update_keeping_stale_preserves_flag() {
        let store = InMemoryCacheStore::new();
        store.set(&key("reference"), vec![json!({"id": "p-1"})]);
        store.invalidate_where(&|k: &CacheKey| k.verb() == "reference");

        let mut next = Some(vec![json!({"id": "p-2"})]);
        assert!(store.update_keeping_stale(&key("reference"), &mut |_: &[RawEntity]| next.take()));
        assert!(store.is_stale(&key("reference")));
        assert_eq!(store.get(&key("reference")).unwrap().as_slice(), &[json!({"id": "p-2"})]);

        let mut next = Some(vec![json!({"id": "p-3"})]);
        assert!(store.update(&key("reference"), &mut |_: &[RawEntity]| next.take()));
        assert!(!store.is_stale(&key("reference")));
    }

    #[test]
    fn test_remove_notifies() {
        let store = InMemoryCacheStore::new();
        let (events, listener) = recording_listener();
        store.subscribe(&key("reference"), listener);
        store.set(&key("reference"), vec![]);

        assert!(store.remove(&key("reference")));
        assert!(!store.remove(&key("reference")));
        assert_eq!(events.lock().unwrap().last(), Some(&StoreEvent::Removed));
    }

    #[test]
    fn test_listener_may_read_store() {
        let store = Arc::new(InMemoryCacheStore::new());
        let seen = Arc::new(Mutex::new(0usize));
        let listener: StoreListener = {
            let store = Arc::clone(&store);
            let seen = Arc::clone(&seen);
            Arc::new(move |_: &StoreEvent| {
                *seen.lock().unwrap() = store.get(&key("reference")).map(|e| e.len()).unwrap_or(0);
            })
        };
        store.subscribe(&key("reference"), listener);
        store.set(&key("reference"), vec![json!({"id": "a"}), json!({"id": "b"})]);
        assert_eq!(*seen.lock().unwrap(), 2);
    }
}
