//! The worker that always polls, and owns the rest of the pool

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::info;
use wq_common::IdleStatus;

use crate::collection::WorkerCollection;
use crate::error::ConsumerError;
use crate::processing::{IdleHook, ProcessingFactory};
use crate::wait_gate::WorkerWaitForEventOrCancel;
use crate::worker::Worker;
use crate::Result;

/// Turns idle edges from any worker of the pool into pause and resume.
/// Checks run under one lock, so the last worker to go idle always sees the
/// others.
struct PauseCoordinator {
    collection: Weak<WorkerCollection>,
    enabled: bool,
    primary_idle: Mutex<bool>,
}

impl PauseCoordinator {
    fn primary_changed(&self, status: IdleStatus) {
        let Some(collection) = self.collection.upgrade() else {
            return;
        };
        let mut primary_idle = self.primary_idle.lock();
        match status {
            IdleStatus::Idle => {
                *primary_idle = true;
                if self.enabled && collection.all_workers_are_idle() {
                    collection.pause_workers();
                }
            }
            IdleStatus::NotIdle => {
                *primary_idle = false;
                collection.resume_workers();
            }
            IdleStatus::Unknown => {}
        }
    }

    fn secondary_changed(&self, status: IdleStatus) {
        if !self.enabled || status != IdleStatus::Idle {
            return;
        }
        let Some(collection) = self.collection.upgrade() else {
            return;
        };
        let primary_idle = self.primary_idle.lock();
        if *primary_idle && collection.all_workers_are_idle() {
            collection.pause_workers();
        }
    }
}

/// Runs the same poll loop as every other worker but is never paused. While
/// it and every secondary are idle, the secondaries are parked on the gate.
pub struct PrimaryWorker {
    worker: Arc<Worker>,
    collection: Arc<WorkerCollection>,
    started: AtomicBool,
}

impl PrimaryWorker {
    pub fn new(
        queue_name: &str,
        worker_count: usize,
        single_worker_when_idle: bool,
        factory: Arc<dyn ProcessingFactory>,
    ) -> Self {
        let mut coordinator = None;
        let collection = Arc::new_cyclic(|weak| {
            let shared = Arc::new(PauseCoordinator {
                collection: weak.clone(),
                enabled: single_worker_when_idle,
                primary_idle: Mutex::new(false),
            });
            coordinator = Some(shared.clone());
            let secondary: IdleHook = Arc::new(move |status: IdleStatus| shared.secondary_changed(status));
            WorkerCollection::new(queue_name, worker_count, single_worker_when_idle, factory.clone())
                .with_idle_hook(secondary)
        });

        let hook: Option<IdleHook> = coordinator.map(|coordinator| {
            Arc::new(move |status: IdleStatus| coordinator.primary_changed(status)) as IdleHook
        });

        let worker = Arc::new(Worker::new(
            format!("{queue_name}-worker-0"),
            factory,
            Arc::new(WorkerWaitForEventOrCancel::bypass()),
            hook,
        ));

        Self {
            worker,
            collection,
            started: AtomicBool::new(false),
        }
    }

    /// Start the secondaries, then this worker
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyStarted("PrimaryWorker::start"));
        }
        self.collection.start()?;
        self.worker.start()?;
        info!(worker = self.worker.name(), "Primary worker started");
        Ok(())
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn collection(&self) -> &Arc<WorkerCollection> {
        &self.collection
    }

    pub fn is_async(&self) -> bool {
        self.worker.is_async()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running() || self.collection.is_running()
    }
}
