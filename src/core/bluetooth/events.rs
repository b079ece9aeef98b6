//! Event fan-out with individually revocable subscriptions

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::utils::lock;

struct Subscribers<E> {
    next_id: u64,
    senders: HashMap<u64, UnboundedSender<E>>,
}

/// Publishes cloned events to every live subscriber
pub struct EventHub<E> {
    inner: Arc<Mutex<Subscribers<E>>>,
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }

    /// Adds a subscriber. Events stop when the returned handle is dropped or revoked.
    pub fn subscribe(&self) -> (Subscription, UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut subs = lock(&self.inner);
            let id = subs.next_id;
            subs.next_id += 1;
            subs.senders.insert(id, tx);
            id
        };

        let weak: Weak<Mutex<Subscribers<E>>> = Arc::downgrade(&self.inner);
        let subscription = Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).senders.remove(&id);
            }
        });
        (subscription, rx)
    }

    /// Sends an event to every subscriber, forgetting those whose receiver is gone
    pub fn publish(&self, event: E) {
        let dropped = {
            let mut subs = lock(&self.inner);
            let before = subs.senders.len();
            subs.senders.retain(|_, tx| tx.send(event.clone()).is_ok());
            before - subs.senders.len()
        };
        // Logged outside the lock, the log sink may itself publish through a hub
        if dropped > 0 {
            debug!("Dropped {} closed event subscribers", dropped);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).senders.len()
    }
}

/// Owned subscription handle; dropping it unsubscribes
pub struct Subscription {
    revoke: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(revoke: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            revoke: Some(Box::new(revoke)),
        }
    }

    /// Unsubscribes now. Safe to call more than once.
    pub fn revoke(&mut self) {
        if let Some(revoke) = self.revoke.take() {
            revoke();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.revoke();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.revoke.is_some())
            .finish()
    }
}

/// Runs a caller-supplied callback; a panic inside it is logged and swallowed
pub(crate) fn deliver<A>(what: &str, callback: impl FnOnce(A), arg: A) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(arg))).is_err() {
        error!("{} panicked; result dropped", what);
    }
}
