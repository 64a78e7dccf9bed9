//! WorkQueue Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Every section falls back to its defaults, so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkQueueConfig {
    pub worker: WorkerConfig,
    pub heart_beat: HeartBeatConfig,
    pub queue_wait: QueueWaitConfig,
    pub retry: RetryConfig,
    pub message_expiration: MessageExpirationConfig,
    pub transport: TransportConfig,
}

/// Worker pool sizing and shutdown behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Total number of polling workers, the primary included
    pub worker_count: usize,
    /// Pause every secondary worker while the whole pool is idle
    pub single_worker_when_idle: bool,
    /// How long to wait for workers to exit after the stop signal
    pub time_to_wait_for_workers_to_stop_ms: u64,
    /// How long to wait for workers to exit after the cancel signal
    pub time_to_wait_for_workers_to_cancel_ms: u64,
    /// Abandon worker threads that ignore cancellation (synchronous mode only)
    pub abort_worker_threads_when_stopping: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            single_worker_when_idle: true,
            time_to_wait_for_workers_to_stop_ms: 5_000,
            time_to_wait_for_workers_to_cancel_ms: 10_000,
            abort_worker_threads_when_stopping: false,
        }
    }
}

impl WorkerConfig {
    pub fn time_to_wait_for_workers_to_stop(&self) -> Duration {
        Duration::from_millis(self.time_to_wait_for_workers_to_stop_ms)
    }

    pub fn time_to_wait_for_workers_to_cancel(&self) -> Duration {
        Duration::from_millis(self.time_to_wait_for_workers_to_cancel_ms)
    }
}

/// Heartbeat settings for in-flight messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartBeatConfig {
    pub enabled: bool,
    /// Interval between heartbeat updates for a message being processed
    pub check_time_ms: u64,
    /// A heartbeat older than this marks the message as abandoned
    pub time_ms: u64,
    /// Interval of the stale-heartbeat scan
    pub monitor_time_ms: u64,
    /// Threads dedicated to heartbeat updates
    pub thread_pool_size: usize,
    /// Pending heartbeat updates the pool will queue before rejecting
    pub queue_capacity: usize,
}

impl Default for HeartBeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_time_ms: 10_000,
            time_ms: 60_000,
            monitor_time_ms: 30_000,
            thread_pool_size: 2,
            queue_capacity: 256,
        }
    }
}

impl HeartBeatConfig {
    pub fn check_time(&self) -> Duration {
        Duration::from_millis(self.check_time_ms)
    }

    pub fn time(&self) -> Duration {
        Duration::from_millis(self.time_ms)
    }

    pub fn monitor_time(&self) -> Duration {
        Duration::from_millis(self.monitor_time_ms)
    }
}

/// Backoff sequences, consulted by index and held at the last entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueWaitConfig {
    /// Delays applied after polls that found no message
    pub no_message_ms: Vec<u64>,
    /// Delays applied after transport or system failures
    pub fatal_error_ms: Vec<u64>,
}

impl Default for QueueWaitConfig {
    fn default() -> Self {
        Self {
            no_message_ms: vec![100, 250, 500, 1_000, 2_000],
            fatal_error_ms: vec![1_000, 5_000, 10_000, 30_000],
        }
    }
}

impl QueueWaitConfig {
    pub fn no_message(&self) -> Vec<Duration> {
        self.no_message_ms.iter().copied().map(Duration::from_millis).collect()
    }

    pub fn fatal_error(&self) -> Vec<Duration> {
        self.fatal_error_ms.iter().copied().map(Duration::from_millis).collect()
    }
}

/// Retry policy for messages whose handler failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Rollbacks allowed before the message is moved to the error store
    pub max_retries: u32,
    /// Redelivery delay per attempt; the last entry repeats
    pub delay_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: vec![1_000, 5_000, 15_000],
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.delay_ms.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempt as usize).min(self.delay_ms.len() - 1);
        Duration::from_millis(self.delay_ms[index])
    }
}

/// Expired-message purge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessageExpirationConfig {
    pub enabled: bool,
    pub monitor_time_ms: u64,
}

impl Default for MessageExpirationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_time_ms: 60_000,
        }
    }
}

impl MessageExpirationConfig {
    pub fn monitor_time(&self) -> Duration {
        Duration::from_millis(self.monitor_time_ms)
    }
}

/// Transport connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub connection_string: String,
    pub queue_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_string: "sqlite://./data/workqueue.db?mode=rwc".to_string(),
            queue_name: "default".to_string(),
        }
    }
}

impl WorkQueueConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: WorkQueueConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject settings the consumer engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "worker.worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_wait.no_message_ms.is_empty() {
            return Err(ConfigError::ValidationError(
                "queue_wait.no_message_ms must contain at least one delay".to_string(),
            ));
        }
        if self.queue_wait.fatal_error_ms.is_empty() {
            return Err(ConfigError::ValidationError(
                "queue_wait.fatal_error_ms must contain at least one delay".to_string(),
            ));
        }
        if self.heart_beat.enabled {
            if self.heart_beat.check_time_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "heart_beat.check_time_ms must be greater than zero".to_string(),
                ));
            }
            if self.heart_beat.check_time_ms >= self.heart_beat.time_ms {
                return Err(ConfigError::ValidationError(format!(
                    "heart_beat.check_time_ms ({}) must be less than heart_beat.time_ms ({})",
                    self.heart_beat.check_time_ms, self.heart_beat.time_ms
                )));
            }
            if self.heart_beat.thread_pool_size == 0 {
                return Err(ConfigError::ValidationError(
                    "heart_beat.thread_pool_size must be at least 1".to_string(),
                ));
            }
            if self.heart_beat.monitor_time_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "heart_beat.monitor_time_ms must be greater than zero".to_string(),
                ));
            }
        }
        if self.message_expiration.enabled && self.message_expiration.monitor_time_ms == 0 {
            return Err(ConfigError::ValidationError(
                "message_expiration.monitor_time_ms must be greater than zero".to_string(),
            ));
        }
        if self.transport.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "transport.queue_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# WorkQueue Configuration
# Environment variables (WQ_*) override these settings

[worker]
worker_count = 4
single_worker_when_idle = true
time_to_wait_for_workers_to_stop_ms = 5000
time_to_wait_for_workers_to_cancel_ms = 10000
abort_worker_threads_when_stopping = false

[heart_beat]
enabled = true
check_time_ms = 10000
time_ms = 60000
monitor_time_ms = 30000
thread_pool_size = 2
queue_capacity = 256

[queue_wait]
no_message_ms = [100, 250, 500, 1000, 2000]
fatal_error_ms = [1000, 5000, 10000, 30000]

[retry]
max_retries = 3
delay_ms = [1000, 5000, 15000]

[message_expiration]
enabled = true
monitor_time_ms = 60000

[transport]
connection_string = "sqlite://./data/workqueue.db?mode=rwc"
queue_name = "default"
"#
        .to_string()
    }
}
