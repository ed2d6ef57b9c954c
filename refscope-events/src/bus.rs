//! Topic-keyed listener registry.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;
use uuid::Uuid;

/// A listener receiving every emission on the topics it is registered for.
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// An opaque topic token. Equality is identity: every `Topic::new()` is
/// distinct from every other, whatever its label.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    id: Uuid,
    label: Arc<str>,
}

impl Topic {
    /// Create a fresh topic. The label is for diagnostics only.
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            id: Uuid::now_v7(),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}#{})", self.label, self.id)
    }
}

/// Per-topic publish/subscribe.
///
/// No replay: a listener registered after an emission never sees it.
pub struct EventBus<A> {
    listeners: DashMap<Topic, Vec<Listener<A>>>,
}

impl<A> Default for EventBus<A> {
    fn default() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }
}

impl<A> EventBus<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` on `topic`. Listeners run in registration order.
    pub fn on(&self, topic: &Topic, listener: Listener<A>) {
        self.listeners.entry(topic.clone()).or_default().push(listener);
    }

    /// Remove exactly this listener reference from `topic`.
    ///
    /// Removing a listener that was never registered is a no-op.
    pub fn off(&self, topic: &Topic, listener: &Listener<A>) {
        let now_empty = match self.listeners.get_mut(topic) {
            Some(mut registered) => {
                registered.retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
                registered.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.listeners.remove_if(topic, |_, registered| registered.is_empty());
        }
    }

    /// Deliver `args` to every listener on `topic`.
    ///
    /// Listeners are snapshotted before delivery, so a listener may call
    /// `on`/`off` on this bus without deadlocking. Emitting on a topic with
    /// no listeners is a no-op.
    pub fn emit(&self, topic: &Topic, args: &A) {
        let snapshot: Vec<Listener<A>> = match self.listeners.get(topic) {
            Some(registered) => registered.value().clone(),
            None => {
                trace!(topic = topic.label(), "Emit on topic without listeners");
                return;
            }
        };
        for listener in snapshot {
            listener(args);
        }
    }

    /// Number of listeners currently registered on `topic`.
    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.listeners.get(topic).map(|l| l.len()).unwrap_or(0)
    }
}
