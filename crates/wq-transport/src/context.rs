//! Per-message processing context
//!
//! A [`MessageContext`] lives for exactly one receive/handle/commit cycle.
//! The receiver wires commit and rollback hooks onto it, so the processing
//! pipeline never needs to know which transport it is talking to. Whatever the
//! exit path, dropping the context rolls back an unresolved transaction and
//! runs the cleanup hooks exactly once.

use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use wq_common::{CancellationToken, CorrelationId, HeartBeatStatus, Headers, MessageId, ReceivedMessage};

use crate::Result;

/// Why a message is being handed back to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// Handler failed; make the message visible again after `delay` and
    /// count the attempt
    Retry { delay: Duration },
    /// Processing was abandoned (cancellation, shutdown); release without
    /// counting an attempt
    Abandon,
}

pub type CommitHook = Box<dyn FnOnce() -> Result<()> + Send>;
pub type RollbackHook = Box<dyn FnOnce(RollbackReason) -> Result<()> + Send>;
pub type CleanupHook = Box<dyn FnOnce() + Send>;

/// Heartbeat state shared between the heartbeat worker and user code
#[derive(Default)]
pub struct HeartBeatNotification {
    status: RwLock<Option<HeartBeatStatus>>,
    error: RwLock<Option<String>>,
    /// Cancelled once when a heartbeat update fails
    cancel: CancellationToken,
    failed: AtomicBool,
}

impl HeartBeatNotification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent heartbeat result
    pub fn status(&self) -> Option<HeartBeatStatus> {
        self.status.read().clone()
    }

    pub fn set_status(&self, status: HeartBeatStatus) {
        *self.status.write() = Some(status);
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    /// Signalled when the heartbeat for this message failed
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record a heartbeat failure. Only the first failure is kept and cancels
    /// the token; returns true for that call.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.error.write() = Some(reason.into());
        self.cancel.cancel();
        true
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// What user code sees about the worker processing its message
pub struct WorkerNotification {
    worker_name: String,
    queue_name: String,
    stop: CancellationToken,
    cancel: CancellationToken,
    transport_supports_rollback: bool,
    heart_beat: HeartBeatNotification,
    span: tracing::Span,
}

impl WorkerNotification {
    pub fn new(
        worker_name: impl Into<String>,
        queue_name: impl Into<String>,
        stop: CancellationToken,
        cancel: CancellationToken,
        transport_supports_rollback: bool,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            queue_name: queue_name.into(),
            stop,
            cancel,
            transport_supports_rollback,
            heart_beat: HeartBeatNotification::new(),
            span: tracing::Span::current(),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Fires when the worker should stop taking new work
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Fires when in-flight work should be aborted
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn transport_supports_rollback(&self) -> bool {
        self.transport_supports_rollback
    }

    pub fn heart_beat(&self) -> &HeartBeatNotification {
        &self.heart_beat
    }

    /// The worker's tracing span, for handlers that spawn their own work
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// True when in-flight work should be abandoned, either because the pool
    /// is cancelling or the heartbeat for this message died
    pub fn should_abort(&self) -> bool {
        self.cancel.is_cancelled() || self.heart_beat.cancellation_token().is_cancelled()
    }
}

/// Scoped state for a single message
pub struct MessageContext {
    message_id: Option<MessageId>,
    correlation_id: Option<CorrelationId>,
    headers: Headers,
    notification: Arc<WorkerNotification>,
    commit: Option<CommitHook>,
    rollback: Option<RollbackHook>,
    cleanup: Vec<CleanupHook>,
}

impl MessageContext {
    pub fn new(notification: Arc<WorkerNotification>) -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            headers: Headers::new(),
            notification,
            commit: None,
            rollback: None,
            cleanup: Vec::new(),
        }
    }

    /// Bind the context to a received message
    pub fn set_message(&mut self, message: &ReceivedMessage) {
        self.message_id = Some(message.id.clone());
        self.correlation_id = Some(message.correlation_id.clone());
        self.headers = message.headers.clone();
    }

    /// Bind only an id, for messages that could not be fully read
    pub fn set_message_id(&mut self, message_id: MessageId) {
        self.message_id = Some(message_id);
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn notification(&self) -> &Arc<WorkerNotification> {
        &self.notification
    }

    pub fn register_commit(&mut self, hook: CommitHook) {
        self.commit = Some(hook);
    }

    pub fn register_rollback(&mut self, hook: RollbackHook) {
        self.rollback = Some(hook);
    }

    pub fn register_cleanup(&mut self, hook: CleanupHook) {
        self.cleanup.push(hook);
    }

    /// A commit or rollback is still pending
    pub fn has_transaction(&self) -> bool {
        self.commit.is_some() || self.rollback.is_some()
    }

    /// Finalize the message. Without a registered hook this is a no-op.
    ///
    /// The rollback hook survives a failed commit, so the message can still
    /// be rolled back or released when the context is dropped.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(hook) = self.commit.take() {
            hook()?;
        }
        self.rollback = None;
        Ok(())
    }

    /// Release the message back to the transport
    pub fn rollback(&mut self, reason: RollbackReason) -> Result<()> {
        self.commit = None;
        match self.rollback.take() {
            Some(hook) => hook(reason),
            None => Ok(()),
        }
    }

    /// Forget the pending transaction, e.g. after the message has been moved
    /// to the error store
    pub fn discard_transaction(&mut self) {
        self.commit = None;
        self.rollback = None;
    }
}

impl Drop for MessageContext {
    fn drop(&mut self) {
        if let Some(hook) = self.rollback.take() {
            self.commit = None;
            match panic::catch_unwind(AssertUnwindSafe(|| hook(RollbackReason::Abandon))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    message_id = ?self.message_id,
                    error = %e,
                    "Rollback of unresolved message failed"
                ),
                Err(_) => error!(message_id = ?self.message_id, "Rollback hook panicked"),
            }
        }

        for hook in self.cleanup.drain(..) {
            if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!(message_id = ?self.message_id, "Cleanup hook panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use crate::TransportError;

    fn notification() -> Arc<WorkerNotification> {
        Arc::new(WorkerNotification::new(
            "worker-1",
            "orders",
            CancellationToken::new(),
            CancellationToken::new(),
            true,
        ))
    }

    fn received(id: &str) -> ReceivedMessage {
        ReceivedMessage {
            id: MessageId::from(id),
            correlation_id: CorrelationId::from("corr"),
            body: b"{}".to_vec(),
            headers: Headers::new(),
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_drop_rolls_back_unresolved_message() {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let mut ctx = MessageContext::new(notification());
            ctx.set_message(&received("m-1"));
            let captured = reasons.clone();
            ctx.register_rollback(Box::new(move |reason| {
                captured.lock().push(reason);
                Ok(())
            }));
        }
        assert_eq!(*reasons.lock(), vec![RollbackReason::Abandon]);
    }

    #[test]
    fn test_failed_commit_keeps_rollback() {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let mut ctx = MessageContext::new(notification());
            ctx.set_message(&received("m-1"));
            ctx.register_commit(Box::new(|| Err(TransportError::Commit("db locked".to_string()))));
            let captured = reasons.clone();
            ctx.register_rollback(Box::new(move |reason| {
                captured.lock().push(reason);
                Ok(())
            }));

            assert!(matches!(ctx.commit(), Err(TransportError::Commit(_))));
            assert!(ctx.has_transaction());
            assert!(reasons.lock().is_empty());
        }
        assert_eq!(*reasons.lock(), vec![RollbackReason::Abandon]);
    }

    #[test]
    fn test_commit_clears_rollback() {
        let rollbacks = Arc::new(AtomicU32::new(0));
        let commits = Arc::new(AtomicU32::new(0));
        {
            let mut ctx = MessageContext::new(notification());
            let c = commits.clone();
            let r = rollbacks.clone();
            ctx.register_commit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            ctx.register_rollback(Box::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            ctx.commit().unwrap();
            assert!(!ctx.has_transaction());
        }
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cleanup_runs_once_even_after_panic() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let c = cleanups.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let mut ctx = MessageContext::new(notification());
            ctx.register_cleanup(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_heartbeat_failure_signals_once() {
        let heart_beat = HeartBeatNotification::new();
        assert!(heart_beat.fail("timeout"));
        assert!(!heart_beat.fail("second failure"));
        assert!(heart_beat.cancellation_token().is_cancelled());
        assert_eq!(heart_beat.error().as_deref(), Some("timeout"));
    }
}
