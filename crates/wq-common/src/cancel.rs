//! Blocking cancellation tokens for OS-thread workers
//!
//! Unlike runtime-bound tokens these can be waited on from any thread with a
//! timeout, which is what the polling loops and backoff waits need.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
    /// Tokens cancelled (before this one) when this token is cancelled;
    /// `None` once cancellation has begun
    children: Mutex<Option<Vec<CancellationToken>>>,
}

/// A clonable, thread-safe cancellation signal.
///
/// Clones share state. A token created with [`child_token`](Self::child_token)
/// is cancelled whenever its parent is, and always *before* the parent's own
/// flag flips: observers that see the parent cancelled are guaranteed to see
/// the child cancelled too.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
                children: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Create a token that is cancelled together with (and ahead of) this one.
    /// The child may still be cancelled on its own.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let registered = match self.inner.children.lock().as_mut() {
            Some(children) => {
                children.push(child.clone());
                true
            }
            None => false,
        };
        if !registered {
            child.cancel();
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel this token and its children. Idempotent.
    pub fn cancel(&self) {
        let children = self.inner.children.lock().take().unwrap_or_default();
        for child in &children {
            child.cancel();
        }

        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            let _guard = self.inner.lock.lock();
            self.inner.condvar.notify_all();
        }
    }

    /// Block until cancelled or `timeout` elapses. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };

        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self.inner.condvar.wait_until(&mut guard, deadline).timed_out() {
                return self.is_cancelled();
            }
        }
        true
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            self.inner.condvar.wait(&mut guard);
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
