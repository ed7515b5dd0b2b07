//! Subscriber registry used by the state manager, filter service and the
//! blacklist/history managers. Handlers are called synchronously; a panicking
//! handler is caught and logged so it cannot break fan-out for the others.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Subscribers<T> {
    handlers: Arc<Mutex<HashMap<u64, Handler<T>>>>,
    next_id: AtomicU64,
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a handler. Dropping the returned `Subscription` (or calling
    /// `unsubscribe`) removes it; call `detach` to keep it for the program's
    /// lifetime.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap().insert(id, Arc::new(handler));

        let handlers: Weak<Mutex<HashMap<u64, Handler<T>>>> = Arc::downgrade(&self.handlers);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(handlers) = handlers.upgrade() {
                    handlers.lock().unwrap().remove(&id);
                }
            })),
        }
    }

    /// Calls every registered handler with `payload`. The handler table is
    /// snapshotted first, so a handler may subscribe or unsubscribe without
    /// deadlocking.
    pub fn notify(&self, payload: &T) {
        let snapshot: Vec<(u64, Handler<T>)> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        for (id, handler) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                tracing::warn!(subscriber = id, "subscriber callback panicked, continuing fan-out");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

impl<T: 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `Subscribers::subscribe`. Unsubscribes on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Leaves the handler registered forever.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
