use async_trait::async_trait;
use thiserror::Error;
use wq_common::ReceivedMessage;
use wq_transport::WorkerNotification;

/// Outcome of a failed handler call
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The message could not be processed; subject to the retry policy
    #[error("{0}")]
    Message(String),

    /// The message can never be processed; routed to the poison handler
    #[error("Poison message: {0}")]
    Poison(String),

    /// The handler gave up because of a cancellation signal
    #[error("Processing was canceled")]
    Canceled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn message(reason: impl Into<String>) -> Self {
        HandlerError::Message(reason.into())
    }

    pub fn poison(reason: impl Into<String>) -> Self {
        HandlerError::Poison(reason.into())
    }
}

/// User code invoked once per received message
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        &self,
        message: &ReceivedMessage,
        notification: &WorkerNotification,
    ) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&ReceivedMessage, &WorkerNotification) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(
        &self,
        message: &ReceivedMessage,
        notification: &WorkerNotification,
    ) -> Result<(), HandlerError> {
        self(message, notification)
    }
}

/// Async twin of [`MessageHandler`]
#[async_trait]
pub trait MessageHandlerAsync: Send + Sync + 'static {
    async fn handle(
        &self,
        message: &ReceivedMessage,
        notification: &WorkerNotification,
    ) -> Result<(), HandlerError>;
}
