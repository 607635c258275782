//! Ordered observer list for bridge notifications.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

/// Receives bridge notifications synchronously on the poll loop's task.
///
/// Observers run in registration order and must not block.
pub trait BridgeObserver<T>: Send + Sync {
    fn on_event(&self, event: &T);

    /// Called exactly once, after teardown has finished.
    fn on_dispose(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeNotification<T> {
    Event(T),
    Disposed,
}

impl<T: Clone + Send> BridgeObserver<T> for mpsc::UnboundedSender<BridgeNotification<T>> {
    fn on_event(&self, event: &T) {
        let _ = self.send(BridgeNotification::Event(event.clone()));
    }

    fn on_dispose(&self) {
        let _ = self.send(BridgeNotification::Disposed);
    }
}

struct Registry<T> {
    observers: Vec<Arc<dyn BridgeObserver<T>>>,
    disposed: bool,
}

pub(crate) struct Observers<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Observers<T> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                observers: Vec::new(),
                disposed: false,
            }),
        }
    }

    /// Register an observer. One that arrives after disposal is told so
    /// immediately instead of being kept.
    pub(crate) fn subscribe(&self, observer: Arc<dyn BridgeObserver<T>>) {
        {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            if !registry.disposed {
                registry.observers.push(observer);
                return;
            }
        }
        observer.on_dispose();
    }

    fn snapshot(&self) -> Vec<Arc<dyn BridgeObserver<T>>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .clone()
    }

    /// Deliver a batch: every observer sees event `n` before any sees `n + 1`.
    pub(crate) fn emit(&self, events: &[T]) {
        let observers = self.snapshot();
        for event in events {
            for observer in &observers {
                observer.on_event(event);
            }
        }
    }

    pub(crate) fn dispose(&self) {
        let observers = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            if registry.disposed {
                return;
            }
            registry.disposed = true;
            std::mem::take(&mut registry.observers)
        };
        for observer in observers {
            observer.on_dispose();
        }
    }
}
