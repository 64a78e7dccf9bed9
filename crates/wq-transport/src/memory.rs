//! In-memory transport for tests and embedding
//!
//! Same delivery semantics as the SQLite adapter (visibility delay,
//! expiration, processing status, heartbeat timestamps) without persistence.
//! A few injection points let tests force poison messages and store failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wq_common::{
    headers, AdditionalMessageData, CorrelationId, HeartBeatStatus, Headers, Message, MessageId,
    ReceivedMessage,
};

use crate::{
    ErrorRouter, ExpiredMessageStore, HeartBeatMonitorStore, HeartBeatSender, MessageContext,
    MessageReceiver, MessageReceiverAsync, MessageSender, PoisonMessageHandler, QueueStatus,
    QueueStatusProvider, Result, RollbackReason, Transport, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Waiting,
    Processing,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    correlation_id: CorrelationId,
    body: Vec<u8>,
    headers: Headers,
    status: Status,
    retry_count: u32,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    poison: bool,
}

impl StoredMessage {
    fn to_received(&self) -> ReceivedMessage {
        ReceivedMessage {
            id: self.id.clone(),
            correlation_id: self.correlation_id.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
            retry_count: self.retry_count,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// A message moved out of the queue by the poison handler or error router
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub message_id: MessageId,
    pub reason: String,
    pub retry_count: u32,
    pub poison: bool,
}

#[derive(Default)]
struct MemoryState {
    messages: Vec<StoredMessage>,
    errors: Vec<ErrorRecord>,
    commits: HashMap<MessageId, u32>,
    rollbacks: u32,
    receive_failures: u32,
    heartbeat_failures: u32,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// In-memory queue implementing every collaborator contract
#[derive(Clone)]
pub struct InMemoryTransport {
    queue_name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryTransport {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Enqueue a message that every receive will report as poison
    pub fn enqueue_poison(&self, body: impl Into<Vec<u8>>) -> MessageId {
        let id = MessageId::generate();
        let now = Utc::now();
        self.state.lock().messages.push(StoredMessage {
            id: id.clone(),
            correlation_id: CorrelationId::generate(),
            body: body.into(),
            headers: Headers::new(),
            status: Status::Waiting,
            retry_count: 0,
            enqueued_at: now,
            visible_at: now,
            expires_at: None,
            heartbeat_at: None,
            poison: true,
        });
        id
    }

    /// Make the next `count` receives fail with a store error
    pub fn fail_next_receives(&self, count: u32) {
        self.state.lock().receive_failures = count;
    }

    /// Make the next `count` heartbeat updates fail
    pub fn fail_next_heartbeats(&self, count: u32) {
        self.state.lock().heartbeat_failures = count;
    }

    /// Times `id` was committed
    pub fn commit_count(&self, id: &MessageId) -> u32 {
        self.state.lock().commits.get(id).copied().unwrap_or(0)
    }

    /// Ids committed at least once
    pub fn committed(&self) -> Vec<MessageId> {
        self.state.lock().commits.keys().cloned().collect()
    }

    pub fn rollback_count(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.state.lock().errors.clone()
    }

    pub fn waiting_count(&self) -> usize {
        self.count(Status::Waiting)
    }

    pub fn processing_count(&self) -> usize {
        self.count(Status::Processing)
    }

    pub fn retry_count(&self, id: &MessageId) -> Option<u32> {
        self.state
            .lock()
            .messages
            .iter()
            .find(|m| &m.id == id)
            .map(|m| m.retry_count)
    }

    /// Backdate the heartbeat of a message being processed
    pub fn set_heartbeat_at(&self, id: &MessageId, at: DateTime<Utc>) {
        if let Some(m) = self.state.lock().messages.iter_mut().find(|m| &m.id == id) {
            m.heartbeat_at = Some(at);
        }
    }

    /// Make every waiting message visible immediately, ignoring retry delays
    pub fn release_delayed(&self) {
        let now = Utc::now();
        for m in self.state.lock().messages.iter_mut() {
            if m.status == Status::Waiting {
                m.visible_at = now;
            }
        }
    }

    fn count(&self, status: Status) -> usize {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.status == status)
            .count()
    }

    fn move_to_errors(&self, id: &MessageId, reason: &str, poison: bool) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .messages
            .iter()
            .position(|m| &m.id == id)
            .ok_or_else(|| TransportError::NotFound(id.to_string()))?;
        let message = state.messages.remove(index);
        state.errors.push(ErrorRecord {
            message_id: message.id,
            reason: reason.to_string(),
            retry_count: message.retry_count,
            poison,
        });
        Ok(())
    }

    fn commit_hook(&self, id: MessageId) -> crate::context::CommitHook {
        let state = self.state.clone();
        Box::new(move || {
            let mut state = state.lock();
            let index = state
                .messages
                .iter()
                .position(|m| m.id == id && m.status == Status::Processing)
                .ok_or_else(|| TransportError::Commit(format!("message {id} is not being processed")))?;
            state.messages.remove(index);
            *state.commits.entry(id).or_insert(0) += 1;
            Ok(())
        })
    }

    fn rollback_hook(&self, id: MessageId) -> crate::context::RollbackHook {
        let state = self.state.clone();
        Box::new(move |reason| {
            let mut state = state.lock();
            state.rollbacks += 1;
            let message = state
                .messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| TransportError::NotFound(id.to_string()))?;
            let now = Utc::now();
            message.status = Status::Waiting;
            message.heartbeat_at = None;
            match reason {
                RollbackReason::Retry { delay } => {
                    message.retry_count += 1;
                    message.visible_at = now + to_chrono(delay);
                }
                RollbackReason::Abandon => message.visible_at = now,
            }
            Ok(())
        })
    }
}

impl MessageReceiver for InMemoryTransport {
    fn receive(&self, context: &mut MessageContext) -> Result<Option<ReceivedMessage>> {
        let received = {
            let mut state = self.state.lock();
            if state.receive_failures > 0 {
                state.receive_failures -= 1;
                return Err(TransportError::Receive("injected receive failure".to_string()));
            }

            let now = Utc::now();
            let Some(message) = state.messages.iter_mut().find(|m| {
                m.status == Status::Waiting
                    && m.visible_at <= now
                    && m.expires_at.map_or(true, |at| at > now)
            }) else {
                return Ok(None);
            };

            message.status = Status::Processing;
            message.heartbeat_at = Some(now);
            if message.poison {
                context.set_message_id(message.id.clone());
                context.register_rollback(self.rollback_hook(message.id.clone()));
                return Err(TransportError::poison(
                    Some(message.id.clone()),
                    "message body could not be decoded",
                ));
            }
            message.to_received()
        };

        debug!(queue = %self.queue_name, message_id = %received.id, "Received message");
        context.set_message(&received);
        context.register_commit(self.commit_hook(received.id.clone()));
        context.register_rollback(self.rollback_hook(received.id.clone()));
        Ok(Some(received))
    }
}

#[async_trait]
impl MessageReceiverAsync for InMemoryTransport {
    async fn receive_async(&self, context: &mut MessageContext) -> Result<Option<ReceivedMessage>> {
        MessageReceiver::receive(self, context)
    }
}

impl HeartBeatSender for InMemoryTransport {
    fn send(&self, message_id: &MessageId) -> Result<HeartBeatStatus> {
        let mut state = self.state.lock();
        if state.heartbeat_failures > 0 {
            state.heartbeat_failures -= 1;
            return Err(TransportError::Database("injected heartbeat failure".to_string()));
        }
        let now = Utc::now();
        let updated = state
            .messages
            .iter_mut()
            .find(|m| &m.id == message_id && m.status == Status::Processing)
            .map(|m| {
                m.heartbeat_at = Some(now);
                now
            });
        Ok(HeartBeatStatus::new(message_id.clone(), updated))
    }
}

impl PoisonMessageHandler for InMemoryTransport {
    fn handle(&self, context: &MessageContext, error: &TransportError) -> Result<()> {
        let id = match (context.message_id(), error) {
            (Some(id), _) => id.clone(),
            (None, TransportError::Poison { message_id: Some(id), .. }) => id.clone(),
            _ => return Err(TransportError::NotFound("poison message without id".to_string())),
        };
        self.move_to_errors(&id, &error.to_string(), true)
    }
}

impl ErrorRouter for InMemoryTransport {
    fn message_failed_processing(
        &self,
        message: &ReceivedMessage,
        _context: &MessageContext,
        reason: &str,
    ) -> Result<()> {
        self.move_to_errors(&message.id, reason, false)
    }
}

impl MessageSender for InMemoryTransport {
    fn send(&self, message: Message, data: &AdditionalMessageData) -> Result<MessageId> {
        let id = MessageId::generate();
        let correlation_id = data.correlation_id.clone().unwrap_or_default();
        let now = Utc::now();

        let mut message_headers = message.headers;
        message_headers.extend(data.headers.clone());
        message_headers.insert(headers::CORRELATION_ID.to_string(), correlation_id.to_string());
        if let Some(route) = &data.route {
            message_headers.insert(headers::ROUTE.to_string(), route.clone());
        }

        self.state.lock().messages.push(StoredMessage {
            id: id.clone(),
            correlation_id,
            body: message.body,
            headers: message_headers,
            status: Status::Waiting,
            retry_count: 0,
            enqueued_at: now,
            visible_at: now + data.delay.map(to_chrono).unwrap_or_else(chrono::Duration::zero),
            expires_at: data.expiration.map(|e| now + to_chrono(e)),
            heartbeat_at: None,
            poison: false,
        });
        Ok(id)
    }
}

impl HeartBeatMonitorStore for InMemoryTransport {
    fn reset_expired_heartbeats(&self, older_than: Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now - to_chrono(older_than);
        let mut reset = 0;
        for m in self.state.lock().messages.iter_mut() {
            if m.status == Status::Processing && m.heartbeat_at.map_or(false, |at| at < cutoff) {
                m.status = Status::Waiting;
                m.heartbeat_at = None;
                m.visible_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

impl ExpiredMessageStore for InMemoryTransport {
    fn clear_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock();
        let before = state.messages.len();
        state
            .messages
            .retain(|m| m.status == Status::Processing || m.expires_at.map_or(true, |at| at > now));
        Ok(before - state.messages.len())
    }
}

impl QueueStatusProvider for InMemoryTransport {
    fn status(&self) -> Result<QueueStatus> {
        let state = self.state.lock();
        let processing = state
            .messages
            .iter()
            .filter(|m| m.status == Status::Processing)
            .count() as u64;
        Ok(QueueStatus {
            queue_name: self.queue_name.clone(),
            waiting: state.messages.len() as u64 - processing,
            processing,
            error: state.errors.len() as u64,
        })
    }
}

impl Transport for InMemoryTransport {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}
