use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub mod cancel;
pub mod logging;

pub use cancel::CancellationToken;

// ============================================================================
// Identifiers
// ============================================================================

/// Transport-assigned identity of a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id (uuid v4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlates a message with its producer-side request (RPC responses, tracing).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Core Message Types
// ============================================================================

/// Header bag carried alongside every message. Key order is irrelevant.
pub type Headers = HashMap<String, String>;

/// Well-known header keys stamped by the producer side.
pub mod headers {
    pub const CORRELATION_ID: &str = "wq-correlation-id";
    pub const REPLY_TO: &str = "wq-reply-to";
    pub const ROUTE: &str = "wq-route";
}

/// An opaque payload plus its headers, as handed to a producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub body: Vec<u8>,
    #[serde(default)]
    pub headers: Headers,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Build a message whose body is the JSON encoding of `value`
    pub fn from_json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Per-send options supplied by the producer.
#[derive(Debug, Clone, Default)]
pub struct AdditionalMessageData {
    /// Correlation id to stamp; a fresh one is generated when absent
    pub correlation_id: Option<CorrelationId>,
    /// Keep the message invisible to consumers for this long after enqueue
    pub delay: Option<Duration>,
    /// Drop the message if it has not been processed within this window
    pub expiration: Option<Duration>,
    /// Optional route; consumers may filter on it
    pub route: Option<String>,
    /// Extra headers merged over the message's own headers
    pub headers: Headers,
}

impl AdditionalMessageData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message that has been dequeued by a consumer, with tracking metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub body: Vec<u8>,
    pub headers: Headers,
    /// How many times this message was rolled back after a handler failure
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ReceivedMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

// ============================================================================
// Worker State Types
// ============================================================================

/// Result of a heartbeat update.
///
/// `last_heartbeat == None` means the row backing the message no longer
/// exists; callers treat that as informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartBeatStatus {
    pub message_id: MessageId,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl HeartBeatStatus {
    pub fn new(message_id: MessageId, last_heartbeat: Option<DateTime<Utc>>) -> Self {
        Self {
            message_id,
            last_heartbeat,
        }
    }
}

/// Per-worker idle state, driven only by the processing Idle/NotIdle edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdleStatus {
    #[default]
    Unknown,
    Idle,
    NotIdle,
}
