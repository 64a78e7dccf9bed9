//! Single-message pipeline: receive, handle, commit
//!
//! One call to [`MessageProcessor::handle`] runs exactly one cycle and never
//! lets an error or panic escape. Outcomes are reported through events,
//! notifications, rollbacks and backoff waits instead.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};
use wq_common::{IdleStatus, ReceivedMessage};
use wq_config::{QueueWaitConfig, WorkQueueConfig};
use wq_transport::{
    ErrorRouter, MessageContext, MessageReceiver, MessageReceiverAsync, PoisonMessageHandler,
    RollbackReason, TransportError, TransportServices, WorkerNotification,
};

use crate::cancel_work::QueueCancelWork;
use crate::consumer_metrics;
use crate::events::{ConsumerEvents, ProcessingFailure, WorkerEvent};
use crate::handler::{HandlerError, MessageHandler, MessageHandlerAsync};
use crate::heartbeat::{HeartBeatFactory, HeartBeatWorker};
use crate::notification::ConsumerNotification;
use crate::queue_wait::{QueueWait, QueueWaitFactory};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::Result;

/// Called on every idle edge, before the public events fire
pub type IdleHook = Arc<dyn Fn(IdleStatus) + Send + Sync>;

/// Everything a processing pipeline shares with the rest of the pool
pub struct ProcessingDeps {
    pub queue_name: String,
    pub supports_rollback: bool,
    pub events: Arc<ConsumerEvents>,
    pub notification: Arc<dyn ConsumerNotification>,
    pub cancel_work: Arc<QueueCancelWork>,
    pub heart_beat: HeartBeatFactory,
    pub poison: Arc<dyn PoisonMessageHandler>,
    pub error_router: Arc<dyn ErrorRouter>,
    pub retry: RetryPolicy,
    pub queue_wait: QueueWaitConfig,
}

impl ProcessingDeps {
    pub fn new(
        config: &WorkQueueConfig,
        services: &TransportServices,
        events: Arc<ConsumerEvents>,
        notification: Arc<dyn ConsumerNotification>,
        cancel_work: Arc<QueueCancelWork>,
        heart_beat: HeartBeatFactory,
    ) -> Self {
        Self {
            queue_name: services.queue_name.clone(),
            supports_rollback: services.supports_rollback,
            events,
            notification,
            cancel_work,
            heart_beat,
            poison: services.poison.clone(),
            error_router: services.error_router.clone(),
            retry: RetryPolicy::new(config.retry.clone(), services.supports_rollback),
            queue_wait: config.queue_wait.clone(),
        }
    }
}

/// One receive/handle/commit cycle per call
pub trait MessageProcessor: Send {
    fn handle(&mut self);
}

/// Builds the processor each worker thread runs
pub trait ProcessingFactory: Send + Sync {
    fn create(
        &self,
        worker_name: &str,
        idle_hook: IdleHook,
        task_count: Arc<AsyncTaskCount>,
    ) -> Result<Box<dyn MessageProcessor>>;

    fn is_async(&self) -> bool;
}

/// In-flight counter for async processing
#[derive(Debug, Default)]
pub struct AsyncTaskCount {
    count: AtomicUsize,
}

impl AsyncTaskCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> AsyncTaskGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        AsyncTaskGuard {
            count: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

pub struct AsyncTaskGuard {
    count: Arc<AsyncTaskCount>,
}

impl Drop for AsyncTaskGuard {
    fn drop(&mut self) {
        self.count.count.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Failure {
    Canceled,
    Poison(TransportError),
    Receive(TransportError),
    /// Handler or commit failure
    User(String),
    System(String),
}

impl Failure {
    fn from_receive(e: TransportError) -> Self {
        match e {
            TransportError::Canceled => Failure::Canceled,
            e @ TransportError::Poison { .. } => Failure::Poison(e),
            e @ TransportError::Receive(_) => Failure::Receive(e),
            other => Failure::System(other.to_string()),
        }
    }
}

/// Handler result, or the panic message if it panicked
type HandlerOutcome = std::result::Result<std::result::Result<(), HandlerError>, String>;

fn panic_payload(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some(*s)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    match panic_payload(payload) {
        Some(s) => format!("handler panicked: {s}"),
        None => "handler panicked".to_string(),
    }
}

fn receive_panicked(payload: Box<dyn Any + Send>) -> Failure {
    Failure::System(match panic_payload(payload.as_ref()) {
        Some(s) => format!("receiver panicked: {s}"),
        None => "receiver panicked".to_string(),
    })
}

/// State shared by the sync and async pipelines
struct ProcessingCore {
    worker_name: String,
    deps: Arc<ProcessingDeps>,
    no_message_wait: QueueWait,
    fatal_wait: QueueWait,
    idle_hook: IdleHook,
    idle: bool,
}

impl ProcessingCore {
    fn new(worker_name: &str, deps: Arc<ProcessingDeps>, idle_hook: IdleHook) -> Result<Self> {
        let waits = QueueWaitFactory::new(deps.queue_wait.clone(), deps.cancel_work.stop_token());
        Ok(Self {
            worker_name: worker_name.to_string(),
            no_message_wait: waits.no_message()?,
            fatal_wait: waits.fatal_error()?,
            deps,
            idle_hook,
            idle: false,
        })
    }

    fn new_context(&self) -> MessageContext {
        MessageContext::new(Arc::new(WorkerNotification::new(
            self.worker_name.clone(),
            self.deps.queue_name.clone(),
            self.deps.cancel_work.stop_token(),
            self.deps.cancel_work.cancel_token(),
            self.deps.supports_rollback,
        )))
    }

    fn worker_event(&self) -> WorkerEvent {
        WorkerEvent {
            worker_name: self.worker_name.clone(),
        }
    }

    fn no_message(&mut self) {
        if !self.idle {
            self.idle = true;
            debug!(worker = %self.worker_name, "Worker is idle");
            (self.idle_hook)(IdleStatus::Idle);
            self.deps.events.idle.emit(&self.worker_event());
        }
        self.no_message_wait.wait();
    }

    fn message_received(&mut self, message: &ReceivedMessage) {
        self.no_message_wait.reset();
        consumer_metrics::record_message_received(&self.deps.queue_name);
        debug!(worker = %self.worker_name, message_id = %message.id, "Processing message");
        if self.idle {
            self.idle = false;
            (self.idle_hook)(IdleStatus::NotIdle);
            self.deps.events.not_idle.emit(&self.worker_event());
        }
    }

    fn start_heart_beat(&self, ctx: &MessageContext, message: &ReceivedMessage) -> HeartBeatWorker {
        self.deps
            .heart_beat
            .start(message.id.clone(), &self.deps.queue_name, ctx.notification().clone())
    }

    fn finish(
        &mut self,
        ctx: &mut MessageContext,
        message: &ReceivedMessage,
        outcome: HandlerOutcome,
        started: Instant,
    ) -> std::result::Result<(), Failure> {
        let reason = match outcome {
            Ok(Ok(())) => match ctx.commit() {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    consumer_metrics::record_message_committed(&self.deps.queue_name);
                    consumer_metrics::record_processing_latency(&self.deps.queue_name, elapsed);
                    self.deps.notification.on_complete(&message.id, elapsed);
                    return Ok(());
                }
                Err(e) => format!("commit failed: {e}"),
            },
            Ok(Err(HandlerError::Canceled)) => return Err(Failure::Canceled),
            Ok(Err(HandlerError::Poison(reason))) => {
                return Err(Failure::Poison(TransportError::poison(Some(message.id.clone()), reason)))
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => return Err(Failure::System(panic)),
        };

        self.apply_retry(ctx, message, &reason);
        Err(Failure::User(reason))
    }

    fn apply_retry(&self, ctx: &mut MessageContext, message: &ReceivedMessage, reason: &str) {
        let queue = &self.deps.queue_name;
        match self.deps.retry.decide(message.retry_count) {
            RetryDecision::Retry { delay } => match ctx.rollback(RollbackReason::Retry { delay }) {
                Ok(()) => {
                    debug!(
                        message_id = %message.id,
                        retry_count = message.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Message rolled back for retry"
                    );
                    consumer_metrics::record_message_rolled_back(queue, "retry");
                    self.deps.notification.on_rollback(&message.id, reason);
                }
                Err(e) => warn!(message_id = %message.id, error = %e, "Rollback failed"),
            },
            RetryDecision::Fail => {
                match self.deps.error_router.message_failed_processing(message, ctx, reason) {
                    Ok(()) => {
                        ctx.discard_transaction();
                        warn!(
                            message_id = %message.id,
                            retry_count = message.retry_count,
                            reason,
                            "Message moved to error store"
                        );
                        consumer_metrics::record_message_error_routed(queue);
                        self.deps.notification.on_error(&message.id, reason);
                    }
                    Err(e) => {
                        error!(message_id = %message.id, error = %e, "Failed to move message to error store");
                        self.rollback_abandon(ctx, "error routing failed");
                    }
                }
            }
        }
    }

    fn rollback_abandon(&self, ctx: &mut MessageContext, reason: &str) {
        if !ctx.has_transaction() {
            return;
        }
        match ctx.rollback(RollbackReason::Abandon) {
            Ok(()) => {
                consumer_metrics::record_message_rolled_back(&self.deps.queue_name, reason);
                if let Some(id) = ctx.message_id() {
                    self.deps.notification.on_rollback(id, reason);
                }
            }
            Err(e) => warn!(message_id = ?ctx.message_id(), error = %e, "Rollback failed"),
        }
    }

    fn failure_event(&self, ctx: &MessageContext, error: String) -> ProcessingFailure {
        ProcessingFailure {
            worker_name: self.worker_name.clone(),
            message_id: ctx.message_id().cloned(),
            error,
        }
    }

    fn fail(&mut self, ctx: &mut MessageContext, failure: Failure) {
        match failure {
            Failure::Canceled => {
                debug!(worker = %self.worker_name, message_id = ?ctx.message_id(), "Processing canceled");
                self.rollback_abandon(ctx, "canceled");
            }
            Failure::Poison(e) => {
                consumer_metrics::record_poison_message(&self.deps.queue_name);
                warn!(worker = %self.worker_name, message_id = ?ctx.message_id(), error = %e, "Poison message");
                let handled = match self.deps.poison.handle(ctx, &e) {
                    Ok(()) => {
                        ctx.discard_transaction();
                        true
                    }
                    Err(handler_error) => {
                        error!(message_id = ?ctx.message_id(), error = %handler_error, "Poison message handler failed");
                        self.rollback_abandon(ctx, "poison handler failed");
                        false
                    }
                };
                let reason = e.to_string();
                let message_id = ctx.message_id().cloned();
                self.deps.notification.on_poison(message_id.as_ref(), &reason);
                if !handled {
                    self.fatal_wait.wait();
                }
            }
            Failure::Receive(e) => {
                consumer_metrics::record_receive_failure(&self.deps.queue_name);
                warn!(worker = %self.worker_name, error = %e, "Failed to receive message");
                self.fatal_wait.wait();
            }
            Failure::User(reason) => {
                let event = self.failure_event(ctx, reason);
                self.deps.events.user_exception.emit(&event);
            }
            Failure::System(reason) => {
                error!(worker = %self.worker_name, message_id = ?ctx.message_id(), error = %reason, "System failure while processing");
                self.rollback_abandon(ctx, "system failure");
                let event = self.failure_event(ctx, reason);
                self.deps.events.system_exception.emit(&event);
                self.fatal_wait.wait();
            }
        }
    }

    fn on_success(&mut self) {
        self.fatal_wait.reset();
    }
}

/// Synchronous pipeline
pub struct MessageProcessing {
    core: ProcessingCore,
    receiver: Arc<dyn MessageReceiver>,
    handler: Arc<dyn MessageHandler>,
}

impl MessageProcessing {
    pub fn new(
        worker_name: &str,
        deps: Arc<ProcessingDeps>,
        receiver: Arc<dyn MessageReceiver>,
        handler: Arc<dyn MessageHandler>,
        idle_hook: IdleHook,
    ) -> Result<Self> {
        Ok(Self {
            core: ProcessingCore::new(worker_name, deps, idle_hook)?,
            receiver,
            handler,
        })
    }

    fn receive_and_process(&mut self, ctx: &mut MessageContext) -> std::result::Result<(), Failure> {
        let receiver = &self.receiver;
        let received =
            panic::catch_unwind(AssertUnwindSafe(|| receiver.receive(ctx))).map_err(receive_panicked)?;
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.core.no_message();
                return Ok(());
            }
            Err(e) => return Err(Failure::from_receive(e)),
        };
        self.core.message_received(&message);

        let started = Instant::now();
        let heart_beat = self.core.start_heart_beat(ctx, &message);
        let handler = &self.handler;
        let notification = ctx.notification().clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&message, &notification)))
            .map_err(|payload| panic_message(payload.as_ref()));
        heart_beat.stop();

        self.core.finish(ctx, &message, outcome, started)
    }
}

impl MessageProcessor for MessageProcessing {
    fn handle(&mut self) {
        let mut ctx = self.core.new_context();
        match self.receive_and_process(&mut ctx) {
            Ok(()) => self.core.on_success(),
            Err(failure) => self.core.fail(&mut ctx, failure),
        }
    }
}

/// Async pipeline. The worker thread still blocks on each step, so the number
/// of messages in flight never exceeds the number of workers.
pub struct MessageProcessingAsync {
    core: ProcessingCore,
    receiver: Arc<dyn MessageReceiverAsync>,
    handler: Arc<dyn MessageHandlerAsync>,
    runtime: Handle,
    task_count: Arc<AsyncTaskCount>,
}

impl MessageProcessingAsync {
    pub fn new(
        worker_name: &str,
        deps: Arc<ProcessingDeps>,
        receiver: Arc<dyn MessageReceiverAsync>,
        handler: Arc<dyn MessageHandlerAsync>,
        runtime: Handle,
        task_count: Arc<AsyncTaskCount>,
        idle_hook: IdleHook,
    ) -> Result<Self> {
        Ok(Self {
            core: ProcessingCore::new(worker_name, deps, idle_hook)?,
            receiver,
            handler,
            runtime,
            task_count,
        })
    }

    fn receive_and_process(&mut self, ctx: &mut MessageContext) -> std::result::Result<(), Failure> {
        let (runtime, receiver) = (&self.runtime, &self.receiver);
        let received = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(receiver.receive_async(ctx))))
            .map_err(receive_panicked)?;
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.core.no_message();
                return Ok(());
            }
            Err(e) => return Err(Failure::from_receive(e)),
        };
        self.core.message_received(&message);

        let started = Instant::now();
        let heart_beat = self.core.start_heart_beat(ctx, &message);
        let handler = self.handler.clone();
        let notification = ctx.notification().clone();
        let task_message = message.clone();
        let task = self
            .runtime
            .spawn(async move { handler.handle(&task_message, &notification).await });
        let outcome = self.runtime.block_on(task).map_err(|e| {
            if e.is_panic() {
                panic_message(e.into_panic().as_ref())
            } else {
                format!("handler task failed: {e}")
            }
        });
        heart_beat.stop();

        self.core.finish(ctx, &message, outcome, started)
    }
}

impl MessageProcessor for MessageProcessingAsync {
    fn handle(&mut self) {
        let _task = self.task_count.enter();
        let mut ctx = self.core.new_context();
        match self.receive_and_process(&mut ctx) {
            Ok(()) => self.core.on_success(),
            Err(failure) => self.core.fail(&mut ctx, failure),
        }
    }
}

pub struct SyncProcessingFactory {
    deps: Arc<ProcessingDeps>,
    receiver: Arc<dyn MessageReceiver>,
    handler: Arc<dyn MessageHandler>,
}

impl SyncProcessingFactory {
    pub fn new(
        deps: Arc<ProcessingDeps>,
        receiver: Arc<dyn MessageReceiver>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            deps,
            receiver,
            handler,
        }
    }
}

impl ProcessingFactory for SyncProcessingFactory {
    fn create(
        &self,
        worker_name: &str,
        idle_hook: IdleHook,
        _task_count: Arc<AsyncTaskCount>,
    ) -> Result<Box<dyn MessageProcessor>> {
        Ok(Box::new(MessageProcessing::new(
            worker_name,
            self.deps.clone(),
            self.receiver.clone(),
            self.handler.clone(),
            idle_hook,
        )?))
    }

    fn is_async(&self) -> bool {
        false
    }
}

pub struct AsyncProcessingFactory {
    deps: Arc<ProcessingDeps>,
    receiver: Arc<dyn MessageReceiverAsync>,
    handler: Arc<dyn MessageHandlerAsync>,
    runtime: Handle,
}

impl AsyncProcessingFactory {
    pub fn new(
        deps: Arc<ProcessingDeps>,
        receiver: Arc<dyn MessageReceiverAsync>,
        handler: Arc<dyn MessageHandlerAsync>,
        runtime: Handle,
    ) -> Self {
        Self {
            deps,
            receiver,
            handler,
            runtime,
        }
    }
}

impl ProcessingFactory for AsyncProcessingFactory {
    fn create(
        &self,
        worker_name: &str,
        idle_hook: IdleHook,
        task_count: Arc<AsyncTaskCount>,
    ) -> Result<Box<dyn MessageProcessor>> {
        Ok(Box::new(MessageProcessingAsync::new(
            worker_name,
            self.deps.clone(),
            self.receiver.clone(),
            self.handler.clone(),
            self.runtime.clone(),
            task_count,
            idle_hook,
        )?))
    }

    fn is_async(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NoOpConsumerNotification;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use wq_common::{CorrelationId, Headers, MessageId};
    use wq_config::RetryConfig;

    enum Step {
        Empty,
        Message(&'static str, u32),
        /// Message whose commit hook fails
        Uncommittable(&'static str, u32),
        /// Claimed but unreadable
        Poison(&'static str),
        Fail(TransportError),
        Panic,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Commit(String),
        Rollback(String, RollbackReason),
        Poison(Option<String>),
        ErrorRouted(String),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        fail_poison: std::sync::atomic::AtomicBool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    struct ScriptedReceiver {
        steps: Mutex<VecDeque<Step>>,
        recorder: Arc<Recorder>,
    }

    impl ScriptedReceiver {
        fn new(steps: Vec<Step>, recorder: Arc<Recorder>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                recorder,
            }
        }
    }

    impl ScriptedReceiver {
        fn register_rollback(&self, context: &mut MessageContext, id: &'static str) {
            let rollback = self.recorder.clone();
            context.register_rollback(Box::new(move |reason| {
                rollback.calls.lock().push(Call::Rollback(id.to_string(), reason));
                Ok(())
            }));
        }
    }

    impl MessageReceiver for ScriptedReceiver {
        fn receive(&self, context: &mut MessageContext) -> wq_transport::Result<Option<ReceivedMessage>> {
            let step = self.steps.lock().pop_front();
            match step {
                None | Some(Step::Empty) => Ok(None),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Panic) => panic!("receiver bug"),
                Some(Step::Poison(id)) => {
                    context.set_message_id(MessageId::from(id));
                    self.register_rollback(context, id);
                    Err(TransportError::poison(Some(MessageId::from(id)), "garbled"))
                }
                Some(Step::Uncommittable(id, retry_count)) => {
                    let message = scripted_message(id, retry_count);
                    context.set_message(&message);
                    context.register_commit(Box::new(|| Err(TransportError::Commit("db locked".to_string()))));
                    self.register_rollback(context, id);
                    Ok(Some(message))
                }
                Some(Step::Message(id, retry_count)) => {
                    let message = scripted_message(id, retry_count);
                    context.set_message(&message);
                    let commit = self.recorder.clone();
                    context.register_commit(Box::new(move || {
                        commit.calls.lock().push(Call::Commit(id.to_string()));
                        Ok(())
                    }));
                    self.register_rollback(context, id);
                    Ok(Some(message))
                }
            }
        }
    }

    fn scripted_message(id: &'static str, retry_count: u32) -> ReceivedMessage {
        ReceivedMessage {
            id: MessageId::from(id),
            correlation_id: CorrelationId::from("corr"),
            body: id.as_bytes().to_vec(),
            headers: Headers::new(),
            retry_count,
            enqueued_at: Utc::now(),
        }
    }

    #[async_trait]
    impl MessageReceiverAsync for ScriptedReceiver {
        async fn receive_async(
            &self,
            context: &mut MessageContext,
        ) -> wq_transport::Result<Option<ReceivedMessage>> {
            MessageReceiver::receive(self, context)
        }
    }

    impl PoisonMessageHandler for Recorder {
        fn handle(&self, context: &MessageContext, _error: &TransportError) -> wq_transport::Result<()> {
            self.calls
                .lock()
                .push(Call::Poison(context.message_id().map(|id| id.to_string())));
            if self.fail_poison.load(Ordering::SeqCst) {
                return Err(TransportError::Database("error table unavailable".to_string()));
            }
            Ok(())
        }
    }

    impl ErrorRouter for Recorder {
        fn message_failed_processing(
            &self,
            message: &ReceivedMessage,
            _context: &MessageContext,
            _reason: &str,
        ) -> wq_transport::Result<()> {
            self.calls.lock().push(Call::ErrorRouted(message.id.to_string()));
            Ok(())
        }
    }

    struct Harness {
        recorder: Arc<Recorder>,
        events: Arc<ConsumerEvents>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            let events = Arc::new(ConsumerEvents::new());
            let log = Arc::new(Mutex::new(Vec::new()));
            let l = log.clone();
            events.idle.subscribe(move |_| l.lock().push("idle".to_string()));
            let l = log.clone();
            events.not_idle.subscribe(move |_| l.lock().push("not_idle".to_string()));
            let l = log.clone();
            events
                .user_exception
                .subscribe(move |f| l.lock().push(format!("user:{}", f.error)));
            let l = log.clone();
            events
                .system_exception
                .subscribe(move |f| l.lock().push(format!("system:{}", f.error)));
            Self {
                recorder: Arc::new(Recorder::default()),
                events,
                log,
            }
        }

        fn deps(&self, max_retries: u32) -> Arc<ProcessingDeps> {
            Arc::new(ProcessingDeps {
                queue_name: "orders".to_string(),
                supports_rollback: true,
                events: self.events.clone(),
                notification: Arc::new(NoOpConsumerNotification),
                cancel_work: Arc::new(QueueCancelWork::new()),
                heart_beat: HeartBeatFactory::disabled(),
                poison: self.recorder.clone(),
                error_router: self.recorder.clone(),
                retry: RetryPolicy::new(
                    RetryConfig {
                        max_retries,
                        delay_ms: vec![5],
                    },
                    true,
                ),
                queue_wait: QueueWaitConfig {
                    no_message_ms: vec![1, 2],
                    fatal_error_ms: vec![1, 2],
                },
            })
        }

        fn processing<H: MessageHandler>(&self, steps: Vec<Step>, handler: H) -> MessageProcessing {
            let receiver = Arc::new(ScriptedReceiver::new(steps, self.recorder.clone()));
            MessageProcessing::new("worker-1", self.deps(3), receiver, Arc::new(handler), Arc::new(|_: IdleStatus| {}))
                .unwrap()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    fn ok_handler(_: &ReceivedMessage, _: &WorkerNotification) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn test_idle_events_fire_on_edges_only() {
        let harness = Harness::new();
        let mut processing = harness.processing(
            vec![Step::Empty, Step::Empty, Step::Message("m-1", 0), Step::Empty],
            ok_handler,
        );

        processing.handle();
        assert_eq!(harness.log(), vec!["idle"]);
        processing.handle();
        assert_eq!(harness.log(), vec!["idle"], "second empty poll must not fire idle again");
        processing.handle();
        assert_eq!(harness.log(), vec!["idle", "not_idle"]);
        processing.handle();
        assert_eq!(harness.log(), vec!["idle", "not_idle", "idle"]);
        assert_eq!(harness.recorder.calls(), vec![Call::Commit("m-1".to_string())]);
    }

    #[test]
    fn test_no_message_backoff_resets_after_receive() {
        let harness = Harness::new();
        let mut processing = harness.processing(
            vec![Step::Empty, Step::Empty, Step::Message("m-1", 0), Step::Empty],
            ok_handler,
        );

        processing.handle();
        processing.handle();
        assert_eq!(processing.core.no_message_wait.current(), Duration::from_millis(2));

        processing.handle();
        assert_eq!(processing.core.no_message_wait.current(), Duration::from_millis(1));
        processing.handle();
        assert_eq!(processing.core.no_message_wait.current(), Duration::from_millis(2));
    }

    #[test]
    fn test_poison_receive_goes_to_poison_handler() {
        let harness = Harness::new();
        let mut processing = harness.processing(
            vec![Step::Fail(TransportError::poison(Some(MessageId::from("bad")), "garbled"))],
            ok_handler,
        );

        processing.handle();
        assert_eq!(harness.recorder.calls(), vec![Call::Poison(None)]);
        assert!(harness.log().is_empty());
        assert_eq!(processing.core.fatal_wait.current(), Duration::from_millis(1));
    }

    #[test]
    fn test_receive_failure_applies_fatal_backoff() {
        let harness = Harness::new();
        let mut processing = harness.processing(
            vec![Step::Fail(TransportError::Receive("database locked".to_string()))],
            ok_handler,
        );

        processing.handle();
        assert!(harness.recorder.calls().is_empty());
        assert!(harness.log().is_empty());
        assert_eq!(processing.core.fatal_wait.current(), Duration::from_millis(2));
    }

    #[test]
    fn test_generic_receive_failure_raises_system_event() {
        let harness = Harness::new();
        let mut processing = harness.processing(
            vec![Step::Fail(TransportError::Other("invalid operation".to_string()))],
            ok_handler,
        );

        processing.handle();
        assert_eq!(harness.log(), vec!["system:invalid operation"]);
        assert_eq!(processing.core.fatal_wait.current(), Duration::from_millis(2));
    }

    #[test]
    fn test_receiver_panic_raises_system_event() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Panic, Step::Message("m-1", 0)], ok_handler);

        processing.handle();
        assert_eq!(harness.log(), vec!["system:receiver panicked: receiver bug"]);
        assert_eq!(processing.core.fatal_wait.current(), Duration::from_millis(2));

        processing.handle();
        assert_eq!(harness.recorder.calls(), vec![Call::Commit("m-1".to_string())]);
        assert_eq!(processing.core.fatal_wait.current(), Duration::from_millis(1));
    }

    #[test]
    fn test_failed_poison_handler_releases_message() {
        let harness = Harness::new();
        harness.recorder.fail_poison.store(true, Ordering::SeqCst);
        let mut processing = harness.processing(vec![Step::Poison("bad")], ok_handler);

        processing.handle();
        assert_eq!(
            harness.recorder.calls(),
            vec![
                Call::Poison(Some("bad".to_string())),
                Call::Rollback("bad".to_string(), RollbackReason::Abandon),
            ]
        );
        assert_eq!(processing.core.fatal_wait.current(), Duration::from_millis(2));
    }

    #[test]
    fn test_handled_poison_message_is_not_rolled_back() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Poison("bad")], ok_handler);

        processing.handle();
        assert_eq!(harness.recorder.calls(), vec![Call::Poison(Some("bad".to_string()))]);
    }

    #[test]
    fn test_failed_commit_rolls_back_for_retry() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Uncommittable("m-1", 0)], ok_handler);

        processing.handle();
        assert_eq!(
            harness.recorder.calls(),
            vec![Call::Rollback(
                "m-1".to_string(),
                RollbackReason::Retry { delay: Duration::from_millis(5) }
            )]
        );
        assert_eq!(harness.log(), vec!["user:commit failed: Commit failed: db locked"]);
    }

    #[test]
    fn test_failed_commit_with_exhausted_retries_routes_to_error_store() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Uncommittable("m-1", 3)], ok_handler);

        processing.handle();
        assert_eq!(harness.recorder.calls(), vec![Call::ErrorRouted("m-1".to_string())]);
    }

    #[test]
    fn test_handler_failure_rolls_back_for_retry() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Message("m-1", 0)], |_: &ReceivedMessage, _: &WorkerNotification| -> std::result::Result<(), HandlerError> {
            Err(HandlerError::message("validation failed"))
        });

        processing.handle();
        assert_eq!(
            harness.recorder.calls(),
            vec![Call::Rollback(
                "m-1".to_string(),
                RollbackReason::Retry { delay: Duration::from_millis(5) }
            )]
        );
        assert_eq!(harness.log(), vec!["user:validation failed"]);
    }

    #[test]
    fn test_exhausted_retries_route_to_error_store() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Message("m-1", 3)], |_: &ReceivedMessage, _: &WorkerNotification| -> std::result::Result<(), HandlerError> {
            Err(HandlerError::message("still failing"))
        });

        processing.handle();
        assert_eq!(harness.recorder.calls(), vec![Call::ErrorRouted("m-1".to_string())]);
        assert_eq!(harness.log(), vec!["user:still failing"]);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Message("m-1", 0)], |_: &ReceivedMessage, _: &WorkerNotification| -> std::result::Result<(), HandlerError> {
            panic!("bug in handler")
        });

        processing.handle();
        assert_eq!(
            harness.recorder.calls(),
            vec![Call::Rollback("m-1".to_string(), RollbackReason::Abandon)]
        );
        assert_eq!(harness.log(), vec!["system:handler panicked: bug in handler"]);
    }

    #[test]
    fn test_canceled_handler_rolls_back_silently() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Message("m-1", 0)], |_: &ReceivedMessage, _: &WorkerNotification| -> std::result::Result<(), HandlerError> {
            Err(HandlerError::Canceled)
        });

        processing.handle();
        assert_eq!(
            harness.recorder.calls(),
            vec![Call::Rollback("m-1".to_string(), RollbackReason::Abandon)]
        );
        assert!(harness.log().is_empty());
    }

    #[test]
    fn test_handler_poison_uses_poison_path() {
        let harness = Harness::new();
        let mut processing = harness.processing(vec![Step::Message("m-1", 0)], |_: &ReceivedMessage, _: &WorkerNotification| -> std::result::Result<(), HandlerError> {
            Err(HandlerError::poison("not json"))
        });

        processing.handle();
        assert_eq!(harness.recorder.calls(), vec![Call::Poison(Some("m-1".to_string()))]);
    }

    struct AsyncOk;

    #[async_trait]
    impl MessageHandlerAsync for AsyncOk {
        async fn handle(
            &self,
            _message: &ReceivedMessage,
            notification: &WorkerNotification,
        ) -> std::result::Result<(), HandlerError> {
            assert_eq!(notification.worker_name(), "worker-1");
            Ok(())
        }
    }

    #[test]
    fn test_async_processing_commits_and_tracks_tasks() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let harness = Harness::new();
        let receiver = Arc::new(ScriptedReceiver::new(vec![Step::Message("m-1", 0)], harness.recorder.clone()));
        let task_count = Arc::new(AsyncTaskCount::new());
        let mut processing = MessageProcessingAsync::new(
            "worker-1",
            harness.deps(3),
            receiver,
            Arc::new(AsyncOk),
            runtime.handle().clone(),
            task_count.clone(),
            Arc::new(|_: IdleStatus| {}),
        )
        .unwrap();

        processing.handle();
        assert_eq!(harness.recorder.calls(), vec![Call::Commit("m-1".to_string())]);
        assert_eq!(task_count.count(), 0);
    }
}
