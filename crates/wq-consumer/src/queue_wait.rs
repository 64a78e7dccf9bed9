//! Backoff sequencer for empty polls and serious failures

use std::time::Duration;
use wq_common::CancellationToken;
use wq_config::QueueWaitConfig;

use crate::{ConsumerError, Result};

/// Walks an ordered list of delays, holding at the last one until reset.
///
/// Waits end early when the stop token fires. The cancel token is not
/// observed here.
#[derive(Debug)]
pub struct QueueWait {
    durations: Vec<Duration>,
    index: usize,
    stop: CancellationToken,
}

impl QueueWait {
    pub fn new(durations: Vec<Duration>, stop: CancellationToken) -> Result<Self> {
        if durations.is_empty() {
            return Err(ConsumerError::InvalidConfiguration(
                "a backoff sequence needs at least one delay".to_string(),
            ));
        }
        Ok(Self {
            durations,
            index: 0,
            stop,
        })
    }

    /// Delay the next call to [`wait`](Self::wait) will use
    pub fn current(&self) -> Duration {
        self.durations[self.index]
    }

    /// Block for the current delay (or until stop), then advance.
    /// Returns the delay that was scheduled.
    pub fn wait(&mut self) -> Duration {
        let delay = self.current();
        if self.index + 1 < self.durations.len() {
            self.index += 1;
        }
        if !delay.is_zero() {
            self.stop.wait_timeout(delay);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }
}

/// Builds the two independently-indexed backoff sequences a worker uses
#[derive(Debug, Clone)]
pub struct QueueWaitFactory {
    config: QueueWaitConfig,
    stop: CancellationToken,
}

impl QueueWaitFactory {
    pub fn new(config: QueueWaitConfig, stop: CancellationToken) -> Self {
        Self { config, stop }
    }

    pub fn no_message(&self) -> Result<QueueWait> {
        QueueWait::new(self.config.no_message(), self.stop.clone())
    }

    pub fn fatal_error(&self) -> Result<QueueWait> {
        QueueWait::new(self.config.fatal_error(), self.stop.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn test_empty_sequence_is_rejected() {
        assert!(matches!(
            QueueWait::new(Vec::new(), CancellationToken::new()),
            Err(ConsumerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_sequence_advances_then_saturates() {
        let mut wait = QueueWait::new(ms(&[1, 2, 3]), CancellationToken::new()).unwrap();
        let used: Vec<Duration> = (0..6).map(|_| wait.wait()).collect();
        assert_eq!(used, ms(&[1, 2, 3, 3, 3, 3]));
    }

    #[test]
    fn test_reset_returns_to_first_delay() {
        let mut wait = QueueWait::new(ms(&[1, 2, 3]), CancellationToken::new()).unwrap();
        wait.wait();
        wait.wait();
        wait.reset();
        assert_eq!(wait.wait(), Duration::from_millis(1));
    }

    #[test]
    fn test_stop_shortens_wait() {
        let stop = CancellationToken::new();
        stop.cancel();
        let mut wait = QueueWait::new(ms(&[10_000]), stop).unwrap();

        let start = Instant::now();
        wait.wait();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_factory_sequences_are_independent() {
        let config = QueueWaitConfig {
            no_message_ms: vec![1, 2],
            fatal_error_ms: vec![5],
        };
        let factory = QueueWaitFactory::new(config, CancellationToken::new());
        let mut no_message = factory.no_message().unwrap();
        let fatal = factory.fatal_error().unwrap();

        no_message.wait();
        assert_eq!(no_message.current(), Duration::from_millis(2));
        assert_eq!(fatal.current(), Duration::from_millis(5));
    }
}
