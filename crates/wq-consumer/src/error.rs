use std::time::Duration;
use thiserror::Error;
use wq_config::ConfigError;
use wq_transport::TransportError;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("{0} must only be called once")]
    AlreadyStarted(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to spawn thread {name}: {reason}")]
    ThreadSpawn { name: String, reason: String },

    #[error("No response received within {0:?}")]
    RpcTimeout(Duration),

    #[error("Consumer is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
