//! Background maintenance: reclaim stalled messages and purge expired ones

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};
use wq_common::CancellationToken;
use wq_config::WorkQueueConfig;
use wq_transport::{ExpiredMessageStore, HeartBeatMonitorStore, TransportServices};

use crate::cancel_work::DisposeGuard;
use crate::consumer_metrics;
use crate::error::ConsumerError;
use crate::Result;

/// A periodic maintenance task
pub trait Monitor: Send + Sync {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    /// Returns the number of messages affected
    fn run_once(&self) -> Result<usize>;
}

/// Makes messages whose heartbeat went stale visible again
pub struct HeartBeatMonitor {
    store: Arc<dyn HeartBeatMonitorStore>,
    stale_after: Duration,
    interval: Duration,
}

impl HeartBeatMonitor {
    pub fn new(store: Arc<dyn HeartBeatMonitorStore>, stale_after: Duration, interval: Duration) -> Self {
        Self {
            store,
            stale_after,
            interval,
        }
    }
}

impl Monitor for HeartBeatMonitor {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run_once(&self) -> Result<usize> {
        let reset = self.store.reset_expired_heartbeats(self.stale_after)?;
        if reset > 0 {
            warn!(count = reset, "Reset messages with expired heartbeats");
        }
        Ok(reset)
    }
}

/// Deletes waiting messages past their expiration
pub struct ExpiredMessageMonitor {
    store: Arc<dyn ExpiredMessageStore>,
    interval: Duration,
}

impl ExpiredMessageMonitor {
    pub fn new(store: Arc<dyn ExpiredMessageStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

impl Monitor for ExpiredMessageMonitor {
    fn name(&self) -> &'static str {
        "expiration"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run_once(&self) -> Result<usize> {
        let cleared = self.store.clear_expired(Utc::now())?;
        if cleared > 0 {
            info!(count = cleared, "Cleared expired messages");
        }
        Ok(cleared)
    }
}

struct MonitorTask {
    monitor: Arc<dyn Monitor>,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorTask {
    fn stop(&self) {
        self.stop.cancel();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!(monitor = self.monitor.name(), "Monitor thread panicked");
            }
        }
    }
}

/// Owns the maintenance monitors of one queue
pub struct QueueMonitor {
    queue_name: String,
    monitors: Vec<Arc<dyn Monitor>>,
    tasks: Mutex<Vec<Arc<MonitorTask>>>,
    started: AtomicBool,
    disposed: DisposeGuard,
}

impl QueueMonitor {
    pub fn new(queue_name: impl Into<String>, monitors: Vec<Arc<dyn Monitor>>) -> Self {
        Self {
            queue_name: queue_name.into(),
            monitors,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            disposed: DisposeGuard::new(),
        }
    }

    /// Pick the monitors enabled by configuration that the transport supports
    pub fn from_config(config: &WorkQueueConfig, services: &TransportServices) -> Self {
        let mut monitors: Vec<Arc<dyn Monitor>> = Vec::new();

        if config.heart_beat.enabled {
            match &services.heart_beat_monitor {
                Some(store) => monitors.push(Arc::new(HeartBeatMonitor::new(
                    store.clone(),
                    config.heart_beat.time(),
                    config.heart_beat.monitor_time(),
                ))),
                None => debug!(queue = %services.queue_name, "Transport has no heartbeat monitor store"),
            }
        }

        if config.message_expiration.enabled {
            match &services.expiration {
                Some(store) => monitors.push(Arc::new(ExpiredMessageMonitor::new(
                    store.clone(),
                    config.message_expiration.monitor_time(),
                ))),
                None => debug!(queue = %services.queue_name, "Transport has no expiration store"),
            }
        }

        Self::new(services.queue_name.clone(), monitors)
    }

    pub fn monitor_names(&self) -> Vec<&'static str> {
        self.monitors.iter().map(|monitor| monitor.name()).collect()
    }

    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyStarted("QueueMonitor::start"));
        }

        let mut tasks = self.tasks.lock();
        for monitor in &self.monitors {
            let task = Arc::new(MonitorTask {
                monitor: monitor.clone(),
                stop: CancellationToken::new(),
                thread: Mutex::new(None),
            });
            let name = format!("wq-monitor-{}-{}", self.queue_name, monitor.name());
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn({
                    let monitor = monitor.clone();
                    let stop = task.stop.clone();
                    let queue_name = self.queue_name.clone();
                    move || run_monitor(&queue_name, monitor.as_ref(), &stop)
                })
                .map_err(|e| ConsumerError::ThreadSpawn {
                    name,
                    reason: e.to_string(),
                })?;
            *task.thread.lock() = Some(handle);
            tasks.push(task);
        }

        info!(queue = %self.queue_name, monitors = ?self.monitor_names(), "Queue monitors started");
        Ok(())
    }

    /// Stop every monitor in parallel. Safe to repeat, and on an empty set.
    pub fn stop(&self) {
        let tasks: Vec<Arc<MonitorTask>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        thread::scope(|scope| {
            for task in &tasks {
                scope.spawn(move || task.stop());
            }
        });
        debug!(queue = %self.queue_name, "Queue monitors stopped");
    }

    pub fn dispose(&self) {
        if self.disposed.begin() {
            self.stop();
        }
    }
}

impl Drop for QueueMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_monitor(queue_name: &str, monitor: &dyn Monitor, stop: &CancellationToken) {
    let span = info_span!("monitor", queue = %queue_name, monitor = monitor.name());
    let _entered = span.enter();

    while !stop.wait_timeout(monitor.interval()) {
        match monitor.run_once() {
            Ok(affected) => consumer_metrics::record_monitor_run(queue_name, monitor.name(), affected),
            Err(e) => error!(error = %e, "Monitor run failed"),
        }
    }
}
