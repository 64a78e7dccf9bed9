//! Decides what happens to a message whose handler failed

use std::time::Duration;
use wq_config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Roll back and redeliver after `delay`
    Retry { delay: Duration },
    /// Move the message to the error store
    Fail,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    supports_rollback: bool,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, supports_rollback: bool) -> Self {
        Self {
            config,
            supports_rollback,
        }
    }

    /// `retry_count` is the number of rollbacks the message has already had
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if !self.supports_rollback || retry_count >= self.config.max_retries {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry {
            delay: self.config.delay_for(retry_count),
        }
    }
}
