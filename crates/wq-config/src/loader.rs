//! Configuration loader with file and environment variable support

use crate::{ConfigError, WorkQueueConfig};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "workqueue.toml",
    "config.toml",
    "./config/workqueue.toml",
    "/etc/workqueue/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate it
    pub fn load(&self) -> Result<WorkQueueConfig, ConfigError> {
        let mut config = WorkQueueConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = WorkQueueConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file not found, searching default locations");
        }

        if let Ok(path) = env::var("WQ_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_list(val: &str) -> Option<Vec<u64>> {
    val.split(',')
        .map(|s| s.trim().parse::<u64>().ok())
        .collect()
}

/// Apply `WQ_*` overrides. `lookup` resolves a variable name to its value.
pub(crate) fn apply_overrides<F>(config: &mut WorkQueueConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Worker
    if let Some(val) = lookup("WQ_WORKER_COUNT") {
        if let Ok(count) = val.parse() {
            config.worker.worker_count = count;
        }
    }
    if let Some(val) = lookup("WQ_SINGLE_WORKER_WHEN_IDLE") {
        config.worker.single_worker_when_idle = val.parse().unwrap_or(true);
    }
    if let Some(val) = lookup("WQ_STOP_TIMEOUT_MS") {
        if let Ok(ms) = val.parse() {
            config.worker.time_to_wait_for_workers_to_stop_ms = ms;
        }
    }
    if let Some(val) = lookup("WQ_CANCEL_TIMEOUT_MS") {
        if let Ok(ms) = val.parse() {
            config.worker.time_to_wait_for_workers_to_cancel_ms = ms;
        }
    }
    if let Some(val) = lookup("WQ_ABORT_WORKER_THREADS") {
        config.worker.abort_worker_threads_when_stopping = val.parse().unwrap_or(false);
    }

    // Heartbeat
    if let Some(val) = lookup("WQ_HEARTBEAT_ENABLED") {
        config.heart_beat.enabled = val.parse().unwrap_or(true);
    }
    if let Some(val) = lookup("WQ_HEARTBEAT_CHECK_TIME_MS") {
        if let Ok(ms) = val.parse() {
            config.heart_beat.check_time_ms = ms;
        }
    }
    if let Some(val) = lookup("WQ_HEARTBEAT_TIME_MS") {
        if let Ok(ms) = val.parse() {
            config.heart_beat.time_ms = ms;
        }
    }
    if let Some(val) = lookup("WQ_HEARTBEAT_THREADS") {
        if let Ok(threads) = val.parse() {
            config.heart_beat.thread_pool_size = threads;
        }
    }

    // Backoff
    if let Some(list) = lookup("WQ_NO_MESSAGE_WAIT_MS").as_deref().and_then(parse_list) {
        config.queue_wait.no_message_ms = list;
    }
    if let Some(list) = lookup("WQ_FATAL_ERROR_WAIT_MS").as_deref().and_then(parse_list) {
        config.queue_wait.fatal_error_ms = list;
    }

    // Retry
    if let Some(val) = lookup("WQ_MAX_RETRIES") {
        if let Ok(retries) = val.parse() {
            config.retry.max_retries = retries;
        }
    }

    // Expiration
    if let Some(val) = lookup("WQ_MESSAGE_EXPIRATION_ENABLED") {
        config.message_expiration.enabled = val.parse().unwrap_or(true);
    }

    // Transport
    if let Some(val) = lookup("WQ_CONNECTION_STRING") {
        config.transport.connection_string = val;
    }
    if let Some(val) = lookup("WQ_QUEUE_NAME") {
        config.transport.queue_name = val;
    }
}
