//! Rich per-message notifications
//!
//! Complements the event observers with one callback per outcome. Hosts that
//! do not care use [`NoOpConsumerNotification`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wq_common::MessageId;

pub trait ConsumerNotification: Send + Sync {
    /// A message was handed back to the transport
    fn on_rollback(&self, message_id: &MessageId, reason: &str);

    /// A message was routed to the poison handler
    fn on_poison(&self, message_id: Option<&MessageId>, reason: &str);

    /// A message was moved to the error store
    fn on_error(&self, message_id: &MessageId, reason: &str);

    /// A message was committed
    fn on_complete(&self, message_id: &MessageId, elapsed: Duration);
}

pub struct NoOpConsumerNotification;

impl ConsumerNotification for NoOpConsumerNotification {
    fn on_rollback(&self, _message_id: &MessageId, _reason: &str) {}
    fn on_poison(&self, _message_id: Option<&MessageId>, _reason: &str) {}
    fn on_error(&self, _message_id: &MessageId, _reason: &str) {}
    fn on_complete(&self, _message_id: &MessageId, _elapsed: Duration) {}
}

/// Logs every outcome through tracing
pub struct LoggingConsumerNotification;

impl ConsumerNotification for LoggingConsumerNotification {
    fn on_rollback(&self, message_id: &MessageId, reason: &str) {
        info!(message_id = %message_id, reason, "Message rolled back");
    }

    fn on_poison(&self, message_id: Option<&MessageId>, reason: &str) {
        warn!(message_id = ?message_id, reason, "Poison message removed from queue");
    }

    fn on_error(&self, message_id: &MessageId, reason: &str) {
        warn!(message_id = %message_id, reason, "Message moved to error store");
    }

    fn on_complete(&self, message_id: &MessageId, elapsed: Duration) {
        debug!(message_id = %message_id, elapsed_ms = elapsed.as_millis() as u64, "Message completed");
    }
}

/// Fans each notification out to several delegates
pub struct CompositeConsumerNotification {
    delegates: Vec<Arc<dyn ConsumerNotification>>,
}

impl CompositeConsumerNotification {
    pub fn new(delegates: Vec<Arc<dyn ConsumerNotification>>) -> Self {
        Self { delegates }
    }
}

impl ConsumerNotification for CompositeConsumerNotification {
    fn on_rollback(&self, message_id: &MessageId, reason: &str) {
        for d in &self.delegates {
            d.on_rollback(message_id, reason);
        }
    }

    fn on_poison(&self, message_id: Option<&MessageId>, reason: &str) {
        for d in &self.delegates {
            d.on_poison(message_id, reason);
        }
    }

    fn on_error(&self, message_id: &MessageId, reason: &str) {
        for d in &self.delegates {
            d.on_error(message_id, reason);
        }
    }

    fn on_complete(&self, message_id: &MessageId, elapsed: Duration) {
        for d in &self.delegates {
            d.on_complete(message_id, elapsed);
        }
    }
}
