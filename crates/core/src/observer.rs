//! Explicit observer lists for runtime events.
//!
//! Subscribers are called in subscription order. A panicking subscriber is
//! logged and skipped; the remaining subscribers still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct Observers<E> {
    subscribers: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every subscriber.
    pub fn notify(&self, event: &E) {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let snapshot: Vec<Callback<E>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!("event subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("subscribers", &self.len())
            .finish()
    }
}
