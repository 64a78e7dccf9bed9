//! Stop and cancel signals shared by a worker pool

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use wq_common::CancellationToken;

/// Guards a teardown so it runs exactly once
#[derive(Debug, Default)]
pub struct DisposeGuard {
    calls: AtomicUsize,
}

impl DisposeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the first caller only
    pub fn begin(&self) -> bool {
        self.calls.fetch_add(1, Ordering::AcqRel) == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.calls.load(Ordering::Acquire) > 0
    }
}

/// The pool-wide pair of signals.
///
/// "Stop" means take no new work, "cancel" means abort in-flight work. The
/// stop token is a child of the cancel token, so triggering cancel always
/// triggers stop first.
#[derive(Debug)]
pub struct QueueCancelWork {
    cancel: CancellationToken,
    stop: CancellationToken,
    disposed: DisposeGuard,
}

impl QueueCancelWork {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        Self {
            cancel,
            stop,
            disposed: DisposeGuard::new(),
        }
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn request_stop(&self) {
        debug!("Stop requested");
        self.stop.cancel();
    }

    pub fn request_cancel(&self) {
        debug!("Cancel requested");
        self.cancel.cancel();
    }

    /// Release every waiter on both tokens. Only the first call does work.
    pub fn dispose(&self) -> bool {
        if !self.disposed.begin() {
            return false;
        }
        self.cancel.cancel();
        true
    }
}

impl Default for QueueCancelWork {
    fn default() -> Self {
        Self::new()
    }
}
