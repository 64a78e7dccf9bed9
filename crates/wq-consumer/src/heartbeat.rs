//! Heartbeats for messages being processed
//!
//! A [`HeartBeatThreadPool`] owns a small set of named OS threads fed by a
//! bounded channel, plus one timer thread. Each [`HeartBeatWorker`] arms a
//! one-shot timer; when it fires the update is submitted to the pool, and the
//! next tick is armed only once that update has finished, so updates for one
//! message never overlap.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wq_common::MessageId;
use wq_transport::{HeartBeatSender, WorkerNotification};

use crate::cancel_work::DisposeGuard;
use crate::consumer_metrics;
use crate::{ConsumerError, Result};

type Job = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    entries: BinaryHeap<TimerEntry>,
    seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Timer {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

impl Timer {
    fn schedule(&self, delay: Duration, task: Job) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.seq += 1;
        let seq = state.seq;
        state.entries.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            task,
        });
        self.condvar.notify_one();
        true
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let next = state.entries.peek().map(|e| e.deadline);
            match next {
                None => self.condvar.wait(&mut state),
                Some(deadline) if deadline <= now => {
                    let due = state.entries.pop();
                    if let Some(entry) = due {
                        drop(state);
                        if panic::catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
                            error!("Heartbeat timer task panicked");
                        }
                        state = self.state.lock();
                    }
                }
                Some(deadline) => {
                    self.condvar.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.entries.clear();
        self.condvar.notify_all();
    }
}

struct PoolShared {
    jobs: Mutex<Option<Sender<Job>>>,
    timer: Timer,
}

impl PoolShared {
    fn submit(&self, job: Job) -> bool {
        let jobs = self.jobs.lock();
        let Some(sender) = jobs.as_ref() else {
            return false;
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Heartbeat pool queue is full, skipping update");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Dedicated threads for heartbeat updates, isolated from any async runtime
pub struct HeartBeatThreadPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    disposed: DisposeGuard,
}

impl HeartBeatThreadPool {
    pub fn new(thread_count: usize, queue_capacity: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(queue_capacity.max(1));
        let shared = Arc::new(PoolShared {
            jobs: Mutex::new(Some(sender)),
            timer: Timer::default(),
        });

        let mut threads = Vec::with_capacity(thread_count + 1);
        for index in 0..thread_count.max(1) {
            let receiver: Receiver<Job> = receiver.clone();
            let name = format!("wq-heartbeat-{index}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Heartbeat update panicked");
                        }
                    }
                })
                .map_err(|e| ConsumerError::ThreadSpawn {
                    name,
                    reason: e.to_string(),
                })?;
            threads.push(handle);
        }

        let timer_shared = shared.clone();
        let timer = thread::Builder::new()
            .name("wq-heartbeat-timer".to_string())
            .spawn(move || timer_shared.timer.run())
            .map_err(|e| ConsumerError::ThreadSpawn {
                name: "wq-heartbeat-timer".to_string(),
                reason: e.to_string(),
            })?;
        threads.push(timer);

        info!(threads = thread_count.max(1), queue_capacity, "Heartbeat thread pool started");
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
            disposed: DisposeGuard::new(),
        })
    }

    /// Stop the timer, let queued updates drain and join every thread
    pub fn stop(&self) {
        if !self.disposed.begin() {
            return;
        }
        self.shared.timer.shutdown();
        self.shared.jobs.lock().take();

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                error!("Heartbeat thread panicked");
            }
        }
        info!("Heartbeat thread pool stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.disposed.is_disposed()
    }
}

impl Drop for HeartBeatThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct HeartBeatState {
    message_id: MessageId,
    queue_name: String,
    check_time: Duration,
    sender: Arc<dyn HeartBeatSender>,
    notification: Arc<WorkerNotification>,
    pool: Arc<PoolShared>,
    /// Held for the whole of an update; `stop()` takes it to wait one out
    update_lock: Mutex<()>,
    stopped: AtomicBool,
    running: AtomicBool,
}

impl HeartBeatState {
    fn arm(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let state = self.clone();
        self.pool
            .timer
            .schedule(self.check_time, Box::new(move || state.on_tick()));
    }

    fn on_tick(self: Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) || self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.clone();
        if !self.pool.submit(Box::new(move || state.update())) {
            self.running.store(false, Ordering::Release);
            self.arm();
        }
    }

    fn update(self: Arc<Self>) {
        {
            let _guard = self.update_lock.lock();
            if !self.stopped.load(Ordering::Acquire) {
                self.send();
            }
        }
        self.running.store(false, Ordering::Release);
        self.arm();
    }

    fn send(&self) {
        match self.sender.send(&self.message_id) {
            Ok(status) => {
                if status.last_heartbeat.is_none() {
                    info!(
                        message_id = %self.message_id,
                        "Heartbeat target no longer exists"
                    );
                } else {
                    debug!(message_id = %self.message_id, "Heartbeat sent");
                }
                self.notification.heart_beat().set_status(status);
            }
            Err(e) => {
                consumer_metrics::record_heartbeat_failure(&self.queue_name);
                if self.notification.heart_beat().fail(e.to_string()) {
                    error!(
                        message_id = %self.message_id,
                        error = %e,
                        "Heartbeat update failed; signalling the handler"
                    );
                }
            }
        }
    }
}

/// Sends heartbeats for one message until stopped
pub struct HeartBeatWorker {
    state: Option<Arc<HeartBeatState>>,
}

impl HeartBeatWorker {
    /// A worker that never sends anything
    pub fn noop() -> Self {
        Self { state: None }
    }

    pub fn is_noop(&self) -> bool {
        self.state.is_none()
    }

    /// Stop sending. Blocks until an in-flight update has completed.
    pub fn stop(&self) {
        if let Some(state) = &self.state {
            state.stopped.store(true, Ordering::Release);
            let _guard = state.update_lock.lock();
        }
    }
}

impl Drop for HeartBeatWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Creates heartbeat workers, or no-op workers when heartbeats are disabled
#[derive(Clone)]
pub struct HeartBeatFactory {
    inner: Option<HeartBeatFactoryInner>,
}

#[derive(Clone)]
struct HeartBeatFactoryInner {
    pool: Arc<PoolShared>,
    sender: Arc<dyn HeartBeatSender>,
    check_time: Duration,
}

impl HeartBeatFactory {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// A zero `check_time` disables heartbeats
    pub fn new(pool: &HeartBeatThreadPool, sender: Arc<dyn HeartBeatSender>, check_time: Duration) -> Self {
        if check_time.is_zero() {
            return Self::disabled();
        }
        Self {
            inner: Some(HeartBeatFactoryInner {
                pool: pool.shared.clone(),
                sender,
                check_time,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn start(
        &self,
        message_id: MessageId,
        queue_name: &str,
        notification: Arc<WorkerNotification>,
    ) -> HeartBeatWorker {
        let Some(inner) = &self.inner else {
            return HeartBeatWorker::noop();
        };
        let state = Arc::new(HeartBeatState {
            message_id,
            queue_name: queue_name.to_string(),
            check_time: inner.check_time,
            sender: inner.sender.clone(),
            notification,
            pool: inner.pool.clone(),
            update_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });
        state.arm();
        HeartBeatWorker { state: Some(state) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use wq_common::{CancellationToken, HeartBeatStatus};
    use wq_transport::TransportError;

    struct CountingSender {
        calls: AtomicU32,
        fail: bool,
    }

    impl HeartBeatSender for CountingSender {
        fn send(&self, message_id: &MessageId) -> wq_transport::Result<HeartBeatStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransportError::Database("connection lost".to_string()));
            }
            Ok(HeartBeatStatus::new(message_id.clone(), Some(chrono::Utc::now())))
        }
    }

    fn notification() -> Arc<WorkerNotification> {
        Arc::new(WorkerNotification::new(
            "w",
            "orders",
            CancellationToken::new(),
            CancellationToken::new(),
            true,
        ))
    }

    #[test]
    fn test_heartbeats_repeat_until_stopped() {
        let pool = HeartBeatThreadPool::new(1, 16).unwrap();
        let sender = Arc::new(CountingSender { calls: AtomicU32::new(0), fail: false });
        let factory = HeartBeatFactory::new(&pool, sender.clone(), Duration::from_millis(10));

        let notification = notification();
        let worker = factory.start(MessageId::from("m"), "orders", notification.clone());
        thread::sleep(Duration::from_millis(100));
        worker.stop();

        let sent = sender.calls.load(Ordering::SeqCst);
        assert!(sent >= 2, "expected repeated heartbeats, got {sent}");
        assert!(notification.heart_beat().status().is_some());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(sender.calls.load(Ordering::SeqCst), sent);
        pool.stop();
    }

    #[test]
    fn test_failure_cancels_message_token_once() {
        let pool = HeartBeatThreadPool::new(1, 16).unwrap();
        let sender = Arc::new(CountingSender { calls: AtomicU32::new(0), fail: true });
        let factory = HeartBeatFactory::new(&pool, sender.clone(), Duration::from_millis(5));

        let notification = notification();
        let worker = factory.start(MessageId::from("m"), "orders", notification.clone());
        assert!(notification
            .heart_beat()
            .cancellation_token()
            .wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(40));
        worker.stop();

        assert!(sender.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(notification.heart_beat().error().as_deref(), Some("Database error: connection lost"));
        assert!(notification.should_abort());
        pool.stop();
    }

    struct SlowSender {
        entered: CancellationToken,
        finished_at: parking_lot::Mutex<Option<Instant>>,
    }

    impl HeartBeatSender for SlowSender {
        fn send(&self, message_id: &MessageId) -> wq_transport::Result<HeartBeatStatus> {
            self.entered.cancel();
            thread::sleep(Duration::from_millis(100));
            *self.finished_at.lock() = Some(Instant::now());
            Ok(HeartBeatStatus::new(message_id.clone(), Some(chrono::Utc::now())))
        }
    }

    #[test]
    fn test_stop_waits_for_in_flight_update() {
        let pool = HeartBeatThreadPool::new(1, 16).unwrap();
        let sender = Arc::new(SlowSender {
            entered: CancellationToken::new(),
            finished_at: parking_lot::Mutex::new(None),
        });
        let factory = HeartBeatFactory::new(&pool, sender.clone(), Duration::from_millis(5));

        let worker = factory.start(MessageId::from("m"), "orders", notification());
        assert!(sender.entered.wait_timeout(Duration::from_secs(5)));
        worker.stop();
        let stopped_at = Instant::now();

        let finished_at = sender.finished_at.lock().expect("update should have finished");
        assert!(finished_at <= stopped_at);
        pool.stop();
    }

    #[test]
    fn test_disabled_factory_yields_noop() {
        let factory = HeartBeatFactory::disabled();
        let worker = factory.start(MessageId::from("m"), "orders", notification());
        assert!(worker.is_noop());
        worker.stop();
    }

    #[test]
    fn test_pool_stop_is_idempotent() {
        let pool = HeartBeatThreadPool::new(2, 4).unwrap();
        pool.stop();
        pool.stop();
        assert!(pool.is_stopped());
    }
}
