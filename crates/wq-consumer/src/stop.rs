//! Graceful shutdown escalation
//!
//! The ladder is applied the same way to the secondary workers and to the
//! primary: release the gate, stop, wait, check, cancel, wait, then either
//! abandon the thread or keep waiting with a periodic warning. Every worker is
//! disposed at the end, whatever happened before.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use wq_config::WorkerConfig;

use crate::cancel_work::QueueCancelWork;
use crate::wait_gate::WorkerWaitForEventOrCancel;

/// What the ladder needs from a worker
pub trait WorkerHandle: Send + Sync {
    fn name(&self) -> &str;
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// True once the worker has exited
    fn join(&self, timeout: Duration) -> bool;
    fn attempt_to_terminate(&self) -> bool;
    fn abandon(&self);
    fn dispose(&self) -> bool;
}

/// Pool-wide signals the ladder drives
pub trait ShutdownControl: Send + Sync {
    /// Open and cancel the pause gate so no worker stays parked on it
    fn release_gate(&self);
    fn signal_stop(&self);
    fn signal_cancel(&self);
}

/// The signals of one worker pool
pub struct PoolShutdown {
    gate: Option<Arc<WorkerWaitForEventOrCancel>>,
    cancel_work: Arc<QueueCancelWork>,
}

impl PoolShutdown {
    pub fn new(gate: Option<Arc<WorkerWaitForEventOrCancel>>, cancel_work: Arc<QueueCancelWork>) -> Self {
        Self { gate, cancel_work }
    }
}

impl ShutdownControl for PoolShutdown {
    fn release_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.set();
            gate.cancel();
        }
    }

    fn signal_stop(&self) {
        self.cancel_work.request_stop();
    }

    fn signal_cancel(&self) {
        self.cancel_work.request_cancel();
    }
}

#[derive(Debug, Clone)]
pub struct StopOptions {
    pub stop_timeout: Duration,
    pub cancel_timeout: Duration,
    /// Abandon threads that ignore cancellation instead of waiting forever
    pub abandon_stuck_threads: bool,
    pub warn_interval: Duration,
}

impl StopOptions {
    /// Abandoning is never allowed for async workers
    pub fn from_config(config: &WorkerConfig, is_async: bool) -> Self {
        Self {
            stop_timeout: config.time_to_wait_for_workers_to_stop(),
            cancel_timeout: config.time_to_wait_for_workers_to_cancel(),
            abandon_stuck_threads: config.abort_worker_threads_when_stopping && !is_async,
            warn_interval: Duration::from_secs(5),
        }
    }
}

/// The last escalation step that was needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every worker exited after the stop signal
    Stopped,
    /// Exited by the zero-timeout check
    Terminated,
    /// Exited after the cancel signal
    Canceled,
    /// At least one thread was abandoned
    Abandoned,
    /// Needed the unbounded wait
    WaitedOut,
}

pub struct StopWorker<'a> {
    control: &'a dyn ShutdownControl,
    options: StopOptions,
}

impl<'a> StopWorker<'a> {
    pub fn new(control: &'a dyn ShutdownControl, options: StopOptions) -> Self {
        Self { control, options }
    }

    pub fn stop<W>(&self, workers: &[Arc<W>]) -> StopOutcome
    where
        W: WorkerHandle + ?Sized,
    {
        let outcome = self.escalate(workers);
        for worker in workers {
            if panic::catch_unwind(AssertUnwindSafe(|| worker.dispose())).is_err() {
                error!(worker = worker.name(), "Worker dispose panicked");
            }
        }
        outcome
    }

    fn escalate<W>(&self, workers: &[Arc<W>]) -> StopOutcome
    where
        W: WorkerHandle + ?Sized,
    {
        self.control.release_gate();

        self.control.signal_stop();
        for worker in workers {
            worker.stop();
        }

        if join_all(workers, self.options.stop_timeout) {
            return StopOutcome::Stopped;
        }

        let mut still_running = false;
        for worker in workers {
            if !worker.attempt_to_terminate() {
                still_running = true;
            }
        }
        if !still_running {
            return StopOutcome::Terminated;
        }

        info!(
            timeout_ms = self.options.cancel_timeout.as_millis() as u64,
            "Workers did not stop in time; cancelling in-flight work"
        );
        self.control.signal_cancel();
        if join_all(workers, self.options.cancel_timeout) {
            return StopOutcome::Canceled;
        }

        self.force_terminate(workers)
    }

    fn force_terminate<W>(&self, workers: &[Arc<W>]) -> StopOutcome
    where
        W: WorkerHandle + ?Sized,
    {
        let stuck = workers.iter().filter(|worker| worker.is_running());

        if self.options.abandon_stuck_threads {
            for worker in stuck {
                worker.abandon();
            }
            return StopOutcome::Abandoned;
        }

        for worker in stuck {
            let started = Instant::now();
            while !worker.join(self.options.warn_interval) {
                warn!(
                    worker = worker.name(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Still waiting for worker to exit"
                );
            }
        }
        StopOutcome::WaitedOut
    }
}

/// Join every worker against one shared deadline
fn join_all<W>(workers: &[Arc<W>], timeout: Duration) -> bool
where
    W: WorkerHandle + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut all_exited = true;
    for worker in workers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !worker.join(remaining) {
            all_exited = false;
        }
    }
    all_exited
}
