//! Reactive per-id view over one repository's cache entry.
//!
//! A [`ReferenceProjection`] listens to the store for its repository's key
//! and keeps one [`ReferenceSlot`] per id a consumer has asked for. Slots
//! are re-derived through the adaptor whenever the entry changes; observers
//! are notified only when the derived item actually differs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use refscope_core::{ReferenceAdaptor, ReferenceItem};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::registry::Resolver;
use crate::repository::{EntryIndex, Repository};
use crate::store::{StoreEvent, StoreSubscriptionId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type SlotObserver<T> = Arc<dyn Fn(Option<&ReferenceItem<T>>) + Send + Sync>;

struct SlotInner<T> {
    id: String,
    sender: watch::Sender<Option<ReferenceItem<T>>>,
    observers: Mutex<Vec<(u64, SlotObserver<T>)>>,
    next_observer: AtomicU64,
}

/// Reactive handle to the display item for one id.
///
/// Holds `None` until the id resolves, and again if the adaptor rejects the
/// entity or the entry is evicted.
pub struct ReferenceSlot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> Clone for ReferenceSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReferenceSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceSlot")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.sender.borrow())
            .finish()
    }
}

impl<T> ReferenceSlot<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(id: &str) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            inner: Arc::new(SlotInner {
                id: id.to_string(),
                sender,
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current item, if resolved.
    pub fn value(&self) -> Option<ReferenceItem<T>> {
        self.inner.sender.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.sender.borrow().is_some()
    }

    /// Async change stream for this slot.
    pub fn watch(&self) -> watch::Receiver<Option<ReferenceItem<T>>> {
        self.inner.sender.subscribe()
    }

    /// Call `observer` on every change of the item.
    ///
    /// Dropping the returned [`SlotSubscription`] keeps the observer; call
    /// [`SlotSubscription::unsubscribe`] to remove it.
    pub fn subscribe<F>(&self, observer: F) -> SlotSubscription
    where
        F: Fn(Option<&ReferenceItem<T>>) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.observers).push((id, Arc::new(observer)));

        let weak = Arc::downgrade(&self.inner);
        SlotSubscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner.observers).retain(|(observer_id, _)| *observer_id != id);
                }
            })),
        }
    }

    /// True if both handles point at the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Store `next`; returns true if it differs from the current item.
    /// Observers are not called; see [`ReferenceSlot::notify`].
    fn set(&self, next: Option<ReferenceItem<T>>) -> bool {
        self.inner.sender.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn notify(&self) {
        let observers: Vec<SlotObserver<T>> = lock(&self.inner.observers)
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        let value = self.value();
        for observer in observers {
            observer(value.as_ref());
        }
    }

    pub(crate) fn publish(&self, next: Option<ReferenceItem<T>>) -> bool {
        let changed = self.set(next);
        if changed {
            self.notify();
        }
        changed
    }
}

/// Removes a slot observer when unsubscribed.
pub struct SlotSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SlotSubscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Slots keyed by id.
pub(crate) struct SlotTable<T> {
    slots: Mutex<HashMap<String, ReferenceSlot<T>>>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SlotTable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Existing slot for `id`, or a fresh one. The flag is true if created.
    pub(crate) fn get_or_insert(&self, id: &str) -> (ReferenceSlot<T>, bool) {
        let mut slots = lock(&self.slots);
        match slots.get(id) {
            Some(slot) => (slot.clone(), false),
            None => {
                let slot = ReferenceSlot::new(id);
                slots.insert(id.to_string(), slot.clone());
                (slot, true)
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<ReferenceSlot<T>> {
        lock(&self.slots).values().cloned().collect()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        lock(&self.slots).keys().cloned().collect()
    }
}

/// Per-id reactive view over one repository.
pub struct ReferenceProjection<T> {
    repository: Arc<Repository>,
    adaptor: Arc<dyn ReferenceAdaptor<T>>,
    resolver: Resolver,
    slots: SlotTable<T>,
    /// Serializes derivation so slots always end on the latest entry.
    derive_lock: Mutex<()>,
    subscription: Mutex<Option<StoreSubscriptionId>>,
}

impl<T> ReferenceProjection<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a projection and start listening to the repository's entry.
    pub fn subscribe(
        repository: Arc<Repository>,
        adaptor: Arc<dyn ReferenceAdaptor<T>>,
        resolver: Resolver,
    ) -> Arc<Self> {
        let projection = Arc::new(Self {
            repository,
            adaptor,
            resolver,
            slots: SlotTable::default(),
            derive_lock: Mutex::new(()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&projection);
        let id = projection
            .repository
            .subscribe(Arc::new(move |event: &StoreEvent| {
                if let Some(projection) = weak.upgrade() {
                    projection.on_store_event(event);
                }
            }));
        *lock(&projection.subscription) = Some(id);
        projection
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    /// Slot for `id`, deriving its initial value when first tracked.
    /// Returns true alongside the slot if it was created by this call.
    pub fn track(&self, id: &str) -> (ReferenceSlot<T>, bool) {
        let (slot, created) = self.slots.get_or_insert(id);
        if created {
            let changed = {
                let _guard = lock(&self.derive_lock);
                let index = self.repository.indexed();
                slot.set(self.derive(index.as_deref(), id))
            };
            if changed {
                slot.notify();
            }
        }
        (slot, created)
    }

    /// Ask the repository to resolve `id`, unless this projection is frozen.
    pub fn request(&self, id: &str) {
        if self.is_subscribed() {
            (self.resolver)(id);
        }
    }

    /// Ids tracked so far.
    pub fn tracked_ids(&self) -> Vec<String> {
        self.slots.ids()
    }

    /// Stop listening. Slots keep their last value and never change again.
    pub fn unsubscribe(&self) {
        if let Some(id) = lock(&self.subscription).take() {
            self.repository.unsubscribe(id);
            debug!(resource_key = self.repository.resource_key(), "Projection unsubscribed");
        }
    }

    fn derive(&self, index: Option<&EntryIndex>, id: &str) -> Option<ReferenceItem<T>> {
        index
            .and_then(|index| index.get(id))
            .and_then(|raw| self.adaptor.adapt(raw))
    }

    fn on_store_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Updated(_) => self.rederive(),
            StoreEvent::Invalidated => {
                trace!(resource_key = self.repository.resource_key(), "Entry invalidated");
            }
            StoreEvent::Removed => {
                let slots = self.slots.snapshot();
                for slot in &slots {
                    slot.publish(None);
                }
                debug!(
                    resource_key = self.repository.resource_key(),
                    count = slots.len(),
                    "Entry evicted, re-requesting tracked ids"
                );
                for slot in &slots {
                    self.request(slot.id());
                }
            }
        }
    }

    fn rederive(&self) {
        let changed: Vec<ReferenceSlot<T>> = {
            let _guard = lock(&self.derive_lock);
            let index = self.repository.indexed();
            self.slots
                .snapshot()
                .into_iter()
                .filter(|slot| slot.set(self.derive(index.as_deref(), slot.id())))
                .collect()
        };
        for slot in changed {
            slot.notify();
        }
    }
}

impl<T> Drop for ReferenceProjection<T> {
    fn drop(&mut self) {
        let taken = self
            .subscription
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = taken {
            self.repository.unsubscribe(id);
        }
    }
}
