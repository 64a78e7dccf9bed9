use thiserror::Error;
use wq_common::MessageId;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The message exists but cannot be read or handled at all
    #[error("Poison message{}: {reason}", .message_id.as_ref().map(|id| format!(" {id}")).unwrap_or_default())]
    Poison {
        message_id: Option<MessageId>,
        reason: String,
    },

    /// The transport failed to produce a message
    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Transport is stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn poison(message_id: Option<MessageId>, reason: impl Into<String>) -> Self {
        TransportError::Poison {
            message_id,
            reason: reason.into(),
        }
    }

    pub fn is_poison(&self) -> bool {
        matches!(self, TransportError::Poison { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TransportError::Canceled)
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for TransportError {
    fn from(e: sqlx::Error) -> Self {
        TransportError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_display_includes_id() {
        let err = TransportError::poison(Some(MessageId::from("m-1")), "bad headers");
        assert_eq!(err.to_string(), "Poison message m-1: bad headers");
        assert!(err.is_poison());

        let anonymous = TransportError::poison(None, "unreadable");
        assert_eq!(anonymous.to_string(), "Poison message: unreadable");
    }
}
