//! Public consumer surface
//!
//! [`ConsumerQueue`] runs synchronous handlers, [`ConsumerQueueAsync`] runs
//! async handlers on a tokio runtime. Both poll from dedicated OS threads
//! and share the same start and shutdown sequence.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tracing::{info, warn};
use wq_config::WorkQueueConfig;
use wq_transport::TransportServices;

use crate::cancel_work::QueueCancelWork;
use crate::consumer_metrics;
use crate::error::ConsumerError;
use crate::events::{ConsumerEvents, ProcessingFailure, WorkerEvent};
use crate::handler::{MessageHandler, MessageHandlerAsync};
use crate::heartbeat::{HeartBeatFactory, HeartBeatThreadPool};
use crate::monitor::QueueMonitor;
use crate::notification::{ConsumerNotification, NoOpConsumerNotification};
use crate::primary::PrimaryWorker;
use crate::processing::{AsyncProcessingFactory, ProcessingDeps, ProcessingFactory, SyncProcessingFactory};
use crate::stop::{PoolShutdown, StopOptions, StopOutcome, StopWorker};
use crate::Result;

struct ConsumerCore {
    config: Arc<WorkQueueConfig>,
    services: TransportServices,
    events: Arc<ConsumerEvents>,
    notification: Arc<dyn ConsumerNotification>,
    cancel_work: Arc<QueueCancelWork>,
    monitor: QueueMonitor,
    heart_beat_pool: Mutex<Option<HeartBeatThreadPool>>,
    primary: OnceLock<PrimaryWorker>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ConsumerCore {
    fn new(config: WorkQueueConfig, services: TransportServices) -> Result<Self> {
        config.validate()?;
        let monitor = QueueMonitor::from_config(&config, &services);
        Ok(Self {
            config: Arc::new(config),
            services,
            events: Arc::new(ConsumerEvents::new()),
            notification: Arc::new(NoOpConsumerNotification),
            cancel_work: Arc::new(QueueCancelWork::new()),
            monitor,
            heart_beat_pool: Mutex::new(None),
            primary: OnceLock::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    fn heart_beat_factory(&self) -> Result<HeartBeatFactory> {
        let settings = &self.config.heart_beat;
        let Some(sender) = self.services.heart_beat.clone() else {
            return Ok(HeartBeatFactory::disabled());
        };
        if !settings.enabled || settings.check_time().is_zero() {
            return Ok(HeartBeatFactory::disabled());
        }

        let pool = HeartBeatThreadPool::new(settings.thread_pool_size, settings.queue_capacity)?;
        let factory = HeartBeatFactory::new(&pool, sender, settings.check_time());
        *self.heart_beat_pool.lock() = Some(pool);
        Ok(factory)
    }

    fn start<F>(&self, method: &'static str, build: F) -> Result<()>
    where
        F: FnOnce(Arc<ProcessingDeps>) -> Arc<dyn ProcessingFactory>,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyStarted(method));
        }

        let deps = Arc::new(ProcessingDeps::new(
            &self.config,
            &self.services,
            self.events.clone(),
            self.notification.clone(),
            self.cancel_work.clone(),
            self.heart_beat_factory()?,
        ));

        self.monitor.start()?;

        let worker = &self.config.worker;
        let primary = self.primary.get_or_init(|| {
            PrimaryWorker::new(
                &self.services.queue_name,
                worker.worker_count,
                worker.single_worker_when_idle,
                build(deps),
            )
        });
        primary.start()?;

        consumer_metrics::set_active_workers(&self.services.queue_name, worker.worker_count);
        info!(
            queue = %self.services.queue_name,
            workers = worker.worker_count,
            is_async = primary.is_async(),
            "Consumer started"
        );
        Ok(())
    }

    fn stop(&self) {
        if !self.started.load(Ordering::Acquire) || self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = &self.services.queue_name;
        info!(queue = %queue, "Stopping consumer");

        if let Some(primary) = self.primary.get() {
            let options = StopOptions::from_config(&self.config.worker, primary.is_async());
            let collection = primary.collection();

            // The primary takes no new work while the secondaries drain
            primary.worker().stop();
            let secondaries = PoolShutdown::new(Some(collection.gate()), self.cancel_work.clone());
            let outcome = StopWorker::new(&secondaries, options.clone()).stop(&collection.workers());
            collection.dispose();
            log_outcome(queue, "secondary", outcome);

            let own = PoolShutdown::new(None, self.cancel_work.clone());
            let outcome = StopWorker::new(&own, options).stop(&[primary.worker().clone()]);
            log_outcome(queue, "primary", outcome);
        }

        self.monitor.dispose();
        if let Some(pool) = self.heart_beat_pool.lock().take() {
            pool.stop();
        }
        self.cancel_work.dispose();

        consumer_metrics::set_active_workers(queue, 0);
        info!(queue = %queue, "Consumer stopped");
    }

    fn is_running(&self) -> bool {
        self.primary.get().is_some_and(|primary| primary.is_running())
    }
}

fn log_outcome(queue: &str, workers: &str, outcome: StopOutcome) {
    match outcome {
        StopOutcome::Stopped | StopOutcome::Terminated => {
            info!(queue, workers, ?outcome, "Workers stopped")
        }
        StopOutcome::Canceled | StopOutcome::WaitedOut | StopOutcome::Abandoned => {
            warn!(queue, workers, ?outcome, "Workers needed escalation to stop")
        }
    }
}

macro_rules! consumer_surface {
    ($name:ident) => {
        impl $name {
            /// Replace the per-message notification sink. Call before `start`.
            pub fn with_notification(mut self, notification: Arc<dyn ConsumerNotification>) -> Self {
                self.core.notification = notification;
                self
            }

            pub fn on_user_exception<F>(&self, observer: F)
            where
                F: Fn(&ProcessingFailure) + Send + Sync + 'static,
            {
                self.core.events.user_exception.subscribe(observer);
            }

            pub fn on_system_exception<F>(&self, observer: F)
            where
                F: Fn(&ProcessingFailure) + Send + Sync + 'static,
            {
                self.core.events.system_exception.subscribe(observer);
            }

            pub fn on_idle<F>(&self, observer: F)
            where
                F: Fn(&WorkerEvent) + Send + Sync + 'static,
            {
                self.core.events.idle.subscribe(observer);
            }

            pub fn on_not_idle<F>(&self, observer: F)
            where
                F: Fn(&WorkerEvent) + Send + Sync + 'static,
            {
                self.core.events.not_idle.subscribe(observer);
            }

            /// Run the shutdown ladder. Blocks; call from a blocking context.
            pub fn stop(&self) {
                self.core.stop();
            }

            pub fn is_running(&self) -> bool {
                self.core.is_running()
            }

            pub fn queue_name(&self) -> &str {
                &self.core.services.queue_name
            }

            pub fn config(&self) -> &WorkQueueConfig {
                &self.core.config
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.core.stop();
            }
        }
    };
}

/// Consumer running a synchronous handler
pub struct ConsumerQueue {
    core: ConsumerCore,
}

impl ConsumerQueue {
    pub fn new(config: WorkQueueConfig, services: TransportServices) -> Result<Self> {
        if services.receiver.is_none() {
            return Err(ConsumerError::InvalidConfiguration(
                "a message receiver is required".to_string(),
            ));
        }
        Ok(Self {
            core: ConsumerCore::new(config, services)?,
        })
    }

    /// Start polling with `handler`. May only be called once.
    pub fn start<H: MessageHandler>(&self, handler: H) -> Result<()> {
        let receiver = self
            .core
            .services
            .receiver
            .clone()
            .ok_or_else(|| ConsumerError::InvalidConfiguration("a message receiver is required".to_string()))?;
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        self.core.start("ConsumerQueue::start", move |deps| {
            Arc::new(SyncProcessingFactory::new(deps, receiver, handler))
        })
    }
}

consumer_surface!(ConsumerQueue);

/// Consumer running an async handler on a tokio runtime
pub struct ConsumerQueueAsync {
    core: ConsumerCore,
    runtime: Handle,
}

impl ConsumerQueueAsync {
    pub fn new(config: WorkQueueConfig, services: TransportServices, runtime: Handle) -> Result<Self> {
        if services.receiver_async.is_none() {
            return Err(ConsumerError::InvalidConfiguration(
                "an async message receiver is required".to_string(),
            ));
        }
        Ok(Self {
            core: ConsumerCore::new(config, services)?,
            runtime,
        })
    }

    /// Start polling with `handler`. May only be called once.
    pub fn start<H: MessageHandlerAsync>(&self, handler: H) -> Result<()> {
        let receiver = self.core.services.receiver_async.clone().ok_or_else(|| {
            ConsumerError::InvalidConfiguration("an async message receiver is required".to_string())
        })?;
        let handler: Arc<dyn MessageHandlerAsync> = Arc::new(handler);
        let runtime = self.runtime.clone();
        self.core.start("ConsumerQueueAsync::start", move |deps| {
            Arc::new(AsyncProcessingFactory::new(deps, receiver, handler, runtime))
        })
    }
}

consumer_surface!(ConsumerQueueAsync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wq_common::ReceivedMessage;
    use wq_transport::{InMemoryTransport, WorkerNotification};

    use crate::handler::HandlerError;

    fn ok(_: &ReceivedMessage, _: &WorkerNotification) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    fn fast_config() -> WorkQueueConfig {
        let mut config = WorkQueueConfig::default();
        config.worker.worker_count = 2;
        config.worker.time_to_wait_for_workers_to_stop_ms = 2_000;
        config.queue_wait.no_message_ms = vec![5];
        config.queue_wait.fatal_error_ms = vec![5];
        config
    }

    #[test]
    fn test_new_rejects_missing_receiver_and_bad_config() {
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let services = TransportServices::new("orders", transport.clone(), transport.clone());
        assert!(matches!(
            ConsumerQueue::new(fast_config(), services),
            Err(ConsumerError::InvalidConfiguration(_))
        ));

        let mut config = fast_config();
        config.worker.worker_count = 0;
        let services = TransportServices::from_transport(&transport);
        assert!(matches!(ConsumerQueue::new(config, services), Err(ConsumerError::Config(_))));
    }

    #[test]
    fn test_start_twice_fails_and_stop_is_idempotent() {
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let consumer = ConsumerQueue::new(fast_config(), TransportServices::from_transport(&transport)).unwrap();

        consumer.stop();
        consumer.start(ok).unwrap();
        assert!(consumer.is_running());
        assert!(matches!(consumer.start(ok), Err(ConsumerError::AlreadyStarted(_))));

        consumer.stop();
        consumer.stop();
        assert!(!consumer.is_running());
    }

    #[test]
    fn test_async_consumer_requires_async_receiver() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let services = TransportServices::new("orders", transport.clone(), transport.clone())
            .with_receiver(transport.clone());
        assert!(ConsumerQueueAsync::new(fast_config(), services, runtime.handle().clone()).is_err());

        let consumer = ConsumerQueueAsync::new(
            fast_config(),
            TransportServices::from_transport(&transport),
            runtime.handle().clone(),
        )
        .unwrap();
        assert_eq!(consumer.queue_name(), "orders");
        assert_eq!(consumer.config().worker.worker_count, 2);
        drop(consumer);
        runtime.shutdown_timeout(Duration::from_secs(1));
    }
}
