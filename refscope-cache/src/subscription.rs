//! Ties cache subscriptions to the lifetime of a consumer.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Identity of one consumer (a view, a widget, a request scope).
///
/// Issued by [`SubscriptionManager::consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(Uuid);

impl ConsumerHandle {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cleanup run when a consumer is disposed.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Registry of teardowns per live consumer.
///
/// Only live consumers are tracked: disposing a consumer drops its record,
/// so the manager holds nothing for consumers that have gone away.
#[derive(Default)]
pub struct SubscriptionManager {
    live: DashMap<ConsumerHandle, Mutex<Vec<Teardown>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh live consumer.
    pub fn consumer(&self) -> ConsumerHandle {
        let handle = ConsumerHandle::new();
        self.live.insert(handle, Mutex::new(Vec::new()));
        handle
    }

    /// Run `teardown` when `consumer` is disposed. Runs immediately if the
    /// consumer is no longer live.
    pub fn register(&self, consumer: ConsumerHandle, teardown: Teardown) {
        // The shard read lock is held while pushing, so a concurrent dispose
        // either sees this teardown or runs after we fall through.
        if let Some(teardowns) = self.live.get(&consumer) {
            teardowns
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(teardown);
            return;
        }
        debug!(consumer = %consumer, "Consumer not live, tearing down immediately");
        teardown();
    }

    /// Run every teardown registered for `consumer`. Returns how many ran;
    /// disposing twice runs nothing the second time.
    pub fn dispose(&self, consumer: ConsumerHandle) -> usize {
        let teardowns = match self.live.remove(&consumer) {
            Some((_, teardowns)) => teardowns.into_inner().unwrap_or_else(PoisonError::into_inner),
            None => return 0,
        };
        let count = teardowns.len();
        for teardown in teardowns {
            teardown();
        }
        debug!(consumer = %consumer, count = count, "Disposed consumer");
        count
    }

    /// Number of teardowns waiting on `consumer`.
    pub fn pending(&self, consumer: ConsumerHandle) -> usize {
        self.live
            .get(&consumer)
            .map(|t| t.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// True unless `consumer` was issued here and not yet disposed.
    pub fn is_disposed(&self, consumer: ConsumerHandle) -> bool {
        !self.live.contains_key(&consumer)
    }

    /// Number of live consumers.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// A consumer that is disposed when the guard drops.
    pub fn guard(&self) -> ConsumerGuard<'_> {
        ConsumerGuard {
            manager: self,
            handle: self.consumer(),
        }
    }
}

/// Disposes its consumer on drop.
pub struct ConsumerGuard<'a> {
    manager: &'a SubscriptionManager,
    handle: ConsumerHandle,
}

impl ConsumerGuard<'_> {
    pub fn handle(&self) -> ConsumerHandle {
        self.handle
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.manager.dispose(self.handle);
    }
}
