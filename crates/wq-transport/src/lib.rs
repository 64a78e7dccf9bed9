//! Collaborator contracts between the consumer engine and a storage adapter
//!
//! The engine only ever talks to these traits. Adapters implement all of them
//! ([`Transport`]) and are handed to the engine as a [`TransportServices`]
//! bundle, which also lets tests substitute individual collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use wq_common::{AdditionalMessageData, HeartBeatStatus, Message, MessageId, ReceivedMessage};

pub mod context;
pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use context::{HeartBeatNotification, MessageContext, RollbackReason, WorkerNotification};
pub use error::TransportError;
pub use memory::InMemoryTransport;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Message counts for a queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue_name: String,
    /// Messages waiting to be received (including delayed ones)
    pub waiting: u64,
    /// Messages currently held by a consumer
    pub processing: u64,
    /// Messages moved to the error store
    pub error: u64,
}

/// Dequeue one message at a time.
///
/// `Ok(None)` means nothing is currently available. Implementations register
/// commit and rollback hooks on the context for any message they return, and
/// must fail with [`TransportError::Poison`] for unreadable messages and
/// [`TransportError::Receive`] when the store itself failed. A claimed poison
/// row gets a rollback hook too, so it is released if nothing takes it.
pub trait MessageReceiver: Send + Sync {
    fn receive(&self, context: &mut MessageContext) -> Result<Option<ReceivedMessage>>;
}

/// Async twin of [`MessageReceiver`]
#[async_trait]
pub trait MessageReceiverAsync: Send + Sync {
    async fn receive_async(&self, context: &mut MessageContext) -> Result<Option<ReceivedMessage>>;
}

/// Refresh the liveness timestamp of a message being processed
pub trait HeartBeatSender: Send + Sync {
    /// `last_heartbeat == None` in the result means the message is gone
    fn send(&self, message_id: &MessageId) -> Result<HeartBeatStatus>;
}

/// Take a structurally bad message out of the normal flow
pub trait PoisonMessageHandler: Send + Sync {
    fn handle(&self, context: &MessageContext, error: &TransportError) -> Result<()>;
}

/// Move a message whose processing failed for good to the error store
pub trait ErrorRouter: Send + Sync {
    fn message_failed_processing(
        &self,
        message: &ReceivedMessage,
        context: &MessageContext,
        reason: &str,
    ) -> Result<()>;
}

/// Enqueue messages
pub trait MessageSender: Send + Sync {
    fn send(&self, message: Message, data: &AdditionalMessageData) -> Result<MessageId>;

    fn send_batch(&self, messages: Vec<(Message, AdditionalMessageData)>) -> Result<Vec<MessageId>> {
        messages
            .into_iter()
            .map(|(message, data)| self.send(message, &data))
            .collect()
    }
}

/// Release messages whose consumer stopped sending heartbeats
pub trait HeartBeatMonitorStore: Send + Sync {
    /// Returns the number of messages made visible again
    fn reset_expired_heartbeats(&self, older_than: Duration) -> Result<usize>;
}

/// Purge messages whose expiration has passed
pub trait ExpiredMessageStore: Send + Sync {
    /// Returns the number of messages removed
    fn clear_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

pub trait QueueStatusProvider: Send + Sync {
    fn status(&self) -> Result<QueueStatus>;
}

/// A storage adapter implementing every collaborator contract
pub trait Transport:
    MessageReceiver
    + MessageReceiverAsync
    + HeartBeatSender
    + PoisonMessageHandler
    + ErrorRouter
    + MessageSender
    + HeartBeatMonitorStore
    + ExpiredMessageStore
    + QueueStatusProvider
    + 'static
{
    fn queue_name(&self) -> &str;

    /// Whether rolled back messages are redelivered
    fn supports_rollback(&self) -> bool {
        true
    }
}

/// The collaborators the consumer engine runs against
#[derive(Clone)]
pub struct TransportServices {
    pub queue_name: String,
    pub supports_rollback: bool,
    pub receiver: Option<Arc<dyn MessageReceiver>>,
    pub receiver_async: Option<Arc<dyn MessageReceiverAsync>>,
    /// No heartbeats are sent when absent
    pub heart_beat: Option<Arc<dyn HeartBeatSender>>,
    pub poison: Arc<dyn PoisonMessageHandler>,
    pub error_router: Arc<dyn ErrorRouter>,
    pub heart_beat_monitor: Option<Arc<dyn HeartBeatMonitorStore>>,
    pub expiration: Option<Arc<dyn ExpiredMessageStore>>,
    pub status: Option<Arc<dyn QueueStatusProvider>>,
}

impl TransportServices {
    /// A bundle with only the mandatory routing collaborators set
    pub fn new(
        queue_name: impl Into<String>,
        poison: Arc<dyn PoisonMessageHandler>,
        error_router: Arc<dyn ErrorRouter>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            supports_rollback: true,
            receiver: None,
            receiver_async: None,
            heart_beat: None,
            poison,
            error_router,
            heart_beat_monitor: None,
            expiration: None,
            status: None,
        }
    }

    /// Wire every collaborator to the same adapter
    pub fn from_transport<T: Transport>(transport: &Arc<T>) -> Self {
        Self {
            queue_name: transport.queue_name().to_string(),
            supports_rollback: transport.supports_rollback(),
            receiver: Some(transport.clone() as Arc<dyn MessageReceiver>),
            receiver_async: Some(transport.clone() as Arc<dyn MessageReceiverAsync>),
            heart_beat: Some(transport.clone() as Arc<dyn HeartBeatSender>),
            poison: transport.clone() as Arc<dyn PoisonMessageHandler>,
            error_router: transport.clone() as Arc<dyn ErrorRouter>,
            heart_beat_monitor: Some(transport.clone() as Arc<dyn HeartBeatMonitorStore>),
            expiration: Some(transport.clone() as Arc<dyn ExpiredMessageStore>),
            status: Some(transport.clone() as Arc<dyn QueueStatusProvider>),
        }
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn MessageReceiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn with_async_receiver(mut self, receiver: Arc<dyn MessageReceiverAsync>) -> Self {
        self.receiver_async = Some(receiver);
        self
    }

    pub fn with_heart_beat(mut self, heart_beat: Arc<dyn HeartBeatSender>) -> Self {
        self.heart_beat = Some(heart_beat);
        self
    }

    pub fn with_heart_beat_monitor(mut self, store: Arc<dyn HeartBeatMonitorStore>) -> Self {
        self.heart_beat_monitor = Some(store);
        self
    }

    pub fn with_expiration(mut self, store: Arc<dyn ExpiredMessageStore>) -> Self {
        self.expiration = Some(store);
        self
    }

    pub fn without_heart_beat(mut self) -> Self {
        self.heart_beat = None;
        self
    }
}
