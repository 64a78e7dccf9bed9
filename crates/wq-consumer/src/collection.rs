//! The secondary workers of a pool

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};
use wq_common::IdleStatus;

use crate::cancel_work::DisposeGuard;
use crate::error::ConsumerError;
use crate::processing::{IdleHook, ProcessingFactory};
use crate::wait_gate::WorkerWaitForEventOrCancel;
use crate::worker::Worker;
use crate::Result;

/// Owns every worker except the primary. All of them share one pause gate
/// and one set of consumer events.
pub struct WorkerCollection {
    queue_name: String,
    worker_count: usize,
    factory: Arc<dyn ProcessingFactory>,
    gate: Arc<WorkerWaitForEventOrCancel>,
    on_idle_change: Option<IdleHook>,
    workers: Mutex<Vec<Arc<Worker>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    disposed: DisposeGuard,
}

impl WorkerCollection {
    /// `worker_count` includes the primary
    pub fn new(
        queue_name: impl Into<String>,
        worker_count: usize,
        single_worker_when_idle: bool,
        factory: Arc<dyn ProcessingFactory>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            worker_count,
            factory,
            gate: Arc::new(WorkerWaitForEventOrCancel::new(worker_count, single_worker_when_idle)),
            on_idle_change: None,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            disposed: DisposeGuard::new(),
        }
    }

    /// Called on every idle edge of every secondary
    pub fn with_idle_hook(mut self, hook: IdleHook) -> Self {
        self.on_idle_change = Some(hook);
        self
    }

    /// Create and start `worker_count - 1` workers in parallel
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyStarted("WorkerCollection::start"));
        }

        let workers: Vec<Arc<Worker>> = (1..self.worker_count.max(1))
            .map(|index| {
                Arc::new(Worker::new(
                    format!("{}-worker-{index}", self.queue_name),
                    self.factory.clone(),
                    self.gate.clone(),
                    self.on_idle_change.clone(),
                ))
            })
            .collect();

        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = workers
                .iter()
                .map(|worker| scope.spawn(move || worker.start()))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|payload| {
                        Err(ConsumerError::ThreadSpawn {
                            name: "worker-start".to_string(),
                            reason: crate::processing::panic_message(payload.as_ref()),
                        })
                    })
                })
                .collect()
        });

        let count = workers.len();
        *self.workers.lock() = workers;
        for result in results {
            result?;
        }

        info!(queue = %self.queue_name, workers = count, "Secondary workers started");
        Ok(())
    }

    /// Tell every worker to exit its loop. Safe to repeat.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(queue = %self.queue_name, "Stopping secondary workers");
        for worker in self.workers.lock().iter() {
            worker.stop();
        }
    }

    /// Reads the cached per-worker flags. True for an empty collection.
    pub fn all_workers_are_idle(&self) -> bool {
        self.workers
            .lock()
            .iter()
            .all(|worker| worker.idle_status() == IdleStatus::Idle)
    }

    pub fn pause_workers(&self) {
        if self.gate.is_enabled() && !self.gate.is_paused() {
            debug!(queue = %self.queue_name, "Pool idle; pausing secondary workers");
        }
        self.gate.reset();
    }

    pub fn resume_workers(&self) {
        self.gate.set();
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_enabled() && self.gate.is_paused()
    }

    pub fn gate(&self) -> Arc<WorkerWaitForEventOrCancel> {
        self.gate.clone()
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().iter().any(|worker| worker.is_running())
    }

    pub fn dispose(&self) -> bool {
        if !self.disposed.begin() {
            return false;
        }
        self.stop();
        for worker in self.workers.lock().iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| worker.dispose())).is_err() {
                error!(worker = worker.name(), "Worker dispose panicked");
            }
        }
        true
    }
}

impl Drop for WorkerCollection {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{AsyncTaskCount, IdleHook, MessageProcessor};
    use std::time::{Duration, Instant};

    struct IdleProcessor {
        hook: IdleHook,
    }

    impl MessageProcessor for IdleProcessor {
        fn handle(&mut self) {
            (self.hook)(IdleStatus::Idle);
            thread::sleep(Duration::from_millis(1));
        }
    }

    struct IdleFactory;

    impl ProcessingFactory for IdleFactory {
        fn create(
            &self,
            _worker_name: &str,
            idle_hook: IdleHook,
            _task_count: Arc<AsyncTaskCount>,
        ) -> Result<Box<dyn MessageProcessor>> {
            Ok(Box::new(IdleProcessor { hook: idle_hook }))
        }

        fn is_async(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_start_creates_all_but_the_primary_and_only_once() {
        let collection = WorkerCollection::new("orders", 4, true, Arc::new(IdleFactory));
        collection.start().unwrap();
        assert_eq!(collection.workers().len(), 3);
        assert_eq!(collection.workers()[0].name(), "orders-worker-1");

        let err = collection.start().unwrap_err();
        assert!(matches!(err, ConsumerError::AlreadyStarted(_)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !collection.all_workers_are_idle() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        collection.stop();
        collection.stop();
        for worker in collection.workers() {
            assert!(worker.join(Duration::from_secs(5)));
        }
        collection.dispose();
        collection.dispose();
    }

    #[test]
    fn test_empty_collection_is_idle_and_stoppable() {
        let collection = WorkerCollection::new("orders", 1, true, Arc::new(IdleFactory));
        collection.start().unwrap();
        assert!(collection.workers().is_empty());
        assert!(collection.all_workers_are_idle());
        collection.stop();
        assert!(!collection.is_running());
        assert!(collection.dispose());
        assert!(!collection.dispose());
    }

    #[test]
    fn test_pause_and_resume_toggle_the_gate() {
        let collection = WorkerCollection::new("orders", 3, true, Arc::new(IdleFactory));
        assert!(!collection.is_paused());
        collection.pause_workers();
        assert!(collection.is_paused());
        collection.resume_workers();
        assert!(!collection.is_paused());

        let disabled = WorkerCollection::new("orders", 3, false, Arc::new(IdleFactory));
        disabled.pause_workers();
        assert!(!disabled.is_paused());
    }
}
