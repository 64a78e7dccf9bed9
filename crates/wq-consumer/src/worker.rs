//! A polling worker owning exactly one OS thread

use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, info_span};
use wq_common::{CancellationToken, IdleStatus};

use crate::cancel_work::DisposeGuard;
use crate::error::ConsumerError;
use crate::processing::{panic_message, AsyncTaskCount, IdleHook, ProcessingFactory};
use crate::stop::WorkerHandle;
use crate::wait_gate::WorkerWaitForEventOrCancel;
use crate::Result;

/// Lifecycle as observed from outside the poll thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    ShouldExit,
    Terminated,
}

/// Fires when the poll thread leaves its loop, whatever the reason
struct ExitSignal(CancellationToken);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub struct Worker {
    name: String,
    factory: Arc<dyn ProcessingFactory>,
    gate: Arc<WorkerWaitForEventOrCancel>,
    on_idle_change: Option<IdleHook>,
    started: AtomicBool,
    should_exit: Arc<AtomicBool>,
    terminated: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    exited: CancellationToken,
    idle: Arc<RwLock<IdleStatus>>,
    task_count: Arc<AsyncTaskCount>,
    disposed: DisposeGuard,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ProcessingFactory>,
        gate: Arc<WorkerWaitForEventOrCancel>,
        on_idle_change: Option<IdleHook>,
    ) -> Self {
        Self {
            name: name.into(),
            factory,
            gate,
            on_idle_change,
            started: AtomicBool::new(false),
            should_exit: Arc::new(AtomicBool::new(false)),
            terminated: AtomicBool::new(false),
            thread: Mutex::new(None),
            exited: CancellationToken::new(),
            idle: Arc::new(RwLock::new(IdleStatus::Unknown)),
            task_count: Arc::new(AsyncTaskCount::new()),
            disposed: DisposeGuard::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the poll thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let idle = self.idle.clone();
        let on_idle_change = self.on_idle_change.clone();
        let hook: IdleHook = Arc::new(move |status: IdleStatus| {
            *idle.write() = status;
            if let Some(callback) = &on_idle_change {
                callback(status);
            }
        });

        let mut processor = match self.factory.create(&self.name, hook, self.task_count.clone()) {
            Ok(processor) => processor,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let name = self.name.clone();
        let should_exit = self.should_exit.clone();
        let gate = self.gate.clone();
        let exit_signal = ExitSignal(self.exited.clone());

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _exit_signal = exit_signal;
                let span = info_span!("worker", worker = %name);
                let _entered = span.enter();
                info!("Worker started");

                while !should_exit.load(Ordering::Acquire) {
                    gate.wait();
                    if should_exit.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| processor.handle())) {
                        error!(error = %panic_message(payload.as_ref()), "Message processing panicked");
                    }
                }

                info!("Worker stopped");
            })
            .map_err(|e| {
                self.started.store(false, Ordering::Release);
                ConsumerError::ThreadSpawn {
                    name: self.name.clone(),
                    reason: e.to_string(),
                }
            })?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Ask the poll loop to exit after the current cycle. Does not join.
    pub fn stop(&self) {
        if !self.should_exit.swap(true, Ordering::AcqRel) {
            debug!(worker = %self.name, "Worker stop requested");
        }
    }

    /// Thread alive, or async work still in flight
    pub fn is_running(&self) -> bool {
        let alive = self
            .thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        (alive && !self.terminated.load(Ordering::Acquire)) || self.task_count.count() > 0
    }

    pub fn state(&self) -> WorkerState {
        if self.terminated.load(Ordering::Acquire) {
            WorkerState::Terminated
        } else if !self.started.load(Ordering::Acquire) {
            WorkerState::NotStarted
        } else if self.should_exit.load(Ordering::Acquire) {
            if self.is_running() {
                WorkerState::ShouldExit
            } else {
                WorkerState::Terminated
            }
        } else {
            WorkerState::Running
        }
    }

    /// Wait up to `timeout` for the poll thread to exit. True once it has.
    pub fn join(&self, timeout: Duration) -> bool {
        if self.thread.lock().is_none() {
            return !self.is_running();
        }
        if self.exited.wait_timeout(timeout) {
            if let Some(handle) = self.thread.lock().take() {
                if handle.join().is_err() {
                    error!(worker = %self.name, "Worker thread panicked");
                }
            }
        }
        !self.is_running()
    }

    /// Join with a zero timeout
    pub fn attempt_to_terminate(&self) -> bool {
        self.join(Duration::ZERO)
    }

    /// Detach a thread that ignored both stop and cancel
    pub fn abandon(&self) {
        if let Some(handle) = self.thread.lock().take() {
            drop(handle);
            self.terminated.store(true, Ordering::Release);
            error!(worker = %self.name, "Worker thread did not exit and was abandoned");
        }
    }

    pub fn idle_status(&self) -> IdleStatus {
        *self.idle.read()
    }

    pub fn is_async(&self) -> bool {
        self.factory.is_async()
    }

    /// Release the worker. Only the first call does work.
    pub fn dispose(&self) -> bool {
        if !self.disposed.begin() {
            return false;
        }
        self.stop();
        if self.exited.is_cancelled() {
            if let Some(handle) = self.thread.lock().take() {
                let _ = handle.join();
            }
        }
        true
    }
}

impl WorkerHandle for Worker {
    fn name(&self) -> &str {
        Worker::name(self)
    }

    fn stop(&self) {
        Worker::stop(self)
    }

    fn is_running(&self) -> bool {
        Worker::is_running(self)
    }

    fn join(&self, timeout: Duration) -> bool {
        Worker::join(self, timeout)
    }

    fn attempt_to_terminate(&self) -> bool {
        Worker::attempt_to_terminate(self)
    }

    fn abandon(&self) {
        Worker::abandon(self)
    }

    fn dispose(&self) -> bool {
        Worker::dispose(self)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::MessageProcessor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingProcessor {
        calls: Arc<AtomicUsize>,
        hook: IdleHook,
    }

    impl MessageProcessor for CountingProcessor {
        fn handle(&mut self) {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.hook)(if n % 2 == 0 { IdleStatus::Idle } else { IdleStatus::NotIdle });
            if n == 2 {
                panic!("processor bug");
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        calls: Arc<AtomicUsize>,
    }

    impl ProcessingFactory for CountingFactory {
        fn create(
            &self,
            _worker_name: &str,
            idle_hook: IdleHook,
            _task_count: Arc<AsyncTaskCount>,
        ) -> Result<Box<dyn MessageProcessor>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingProcessor {
                calls: self.calls.clone(),
                hook: idle_hook,
            }))
        }

        fn is_async(&self) -> bool {
            false
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_is_idempotent_and_stop_exits() {
        let factory = Arc::new(CountingFactory::default());
        let worker = Worker::new("orders-worker-0", factory.clone(), Arc::new(WorkerWaitForEventOrCancel::bypass()), None);
        assert_eq!(worker.state(), WorkerState::NotStarted);

        worker.start().unwrap();
        worker.start().unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        wait_until(|| factory.calls.load(Ordering::SeqCst) > 3);
        assert!(worker.is_running(), "a processor panic must not end the loop");
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop();
        worker.stop();
        assert!(worker.join(Duration::from_secs(5)));
        assert!(!worker.is_running());
        assert_eq!(worker.state(), WorkerState::Terminated);
    }

    #[test]
    fn test_idle_status_follows_hook() {
        let factory = Arc::new(CountingFactory::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let worker = Worker::new(
            "orders-worker-1",
            factory.clone(),
            Arc::new(WorkerWaitForEventOrCancel::bypass()),
            Some(Arc::new(move |status: IdleStatus| s.lock().push(status))),
        );
        assert_eq!(worker.idle_status(), IdleStatus::Unknown);

        worker.start().unwrap();
        wait_until(|| seen.lock().len() >= 2);
        worker.stop();
        assert!(worker.join(Duration::from_secs(5)));

        let seen = seen.lock();
        assert_eq!(seen[0], IdleStatus::Idle);
        assert_eq!(seen[1], IdleStatus::NotIdle);
        assert_eq!(worker.idle_status(), *seen.last().unwrap());
    }

    #[test]
    fn test_paused_gate_blocks_polling() {
        let factory = Arc::new(CountingFactory::default());
        let gate = Arc::new(WorkerWaitForEventOrCancel::new(2, true));
        gate.reset();
        let worker = Worker::new("orders-worker-1", factory.clone(), gate.clone(), None);

        worker.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);

        gate.set();
        wait_until(|| factory.calls.load(Ordering::SeqCst) > 0);

        gate.reset();
        worker.stop();
        gate.cancel();
        assert!(worker.join(Duration::from_secs(5)));
    }

    #[test]
    fn test_join_before_start_and_dispose_once() {
        let factory = Arc::new(CountingFactory::default());
        let worker = Worker::new("orders-worker-2", factory, Arc::new(WorkerWaitForEventOrCancel::bypass()), None);
        assert!(worker.join(Duration::ZERO));
        assert!(worker.attempt_to_terminate());
        assert!(worker.dispose());
        assert!(!worker.dispose());
    }
}
