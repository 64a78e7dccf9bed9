//! Observer registration for consumer events
//!
//! Observers run on the emitting worker's thread. A panicking observer is
//! logged and skipped; it never reaches the emitter.

use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;
use wq_common::MessageId;

/// A failure surfaced to the host
#[derive(Debug, Clone)]
pub struct ProcessingFailure {
    pub worker_name: String,
    pub message_id: Option<MessageId>,
    pub error: String,
}

/// An idle edge seen by a worker
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub worker_name: String,
}

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Observers<T> {
    name: &'static str,
    observers: RwLock<Vec<Observer<T>>>,
}

impl<T> Observers<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    pub fn emit(&self, event: &T) {
        // Snapshot so observers may subscribe without deadlocking
        let observers: Vec<Observer<T>> = self.observers.read().clone();
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                error!(event = self.name, "Event observer panicked");
            }
        }
    }
}

/// Events shared by every worker of a consumer
pub struct ConsumerEvents {
    pub user_exception: Observers<ProcessingFailure>,
    pub system_exception: Observers<ProcessingFailure>,
    pub idle: Observers<WorkerEvent>,
    pub not_idle: Observers<WorkerEvent>,
}

impl ConsumerEvents {
    pub fn new() -> Self {
        Self {
            user_exception: Observers::new("user_exception"),
            system_exception: Observers::new("system_exception"),
            idle: Observers::new("idle"),
            not_idle: Observers::new("not_idle"),
        }
    }
}

impl Default for ConsumerEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_panicking_observer_is_contained() {
        let events = ConsumerEvents::new();
        let calls = Arc::new(AtomicU32::new(0));

        events.system_exception.subscribe(|_| panic!("observer bug"));
        let c = calls.clone();
        events.system_exception.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        events.system_exception.emit(&ProcessingFailure {
            worker_name: "w".to_string(),
            message_id: None,
            error: "boom".to_string(),
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
