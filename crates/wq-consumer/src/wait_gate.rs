//! Pause gate for secondary workers

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct GateState {
    open: bool,
    cancelled: bool,
}

/// A binary gate, initially open.
///
/// [`wait`](Self::wait) passes straight through an open gate, blocks on a
/// closed one, and returns false once the gate has been cancelled.
#[derive(Debug)]
pub struct WaitForEventOrCancel {
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl WaitForEventOrCancel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                open: true,
                cancelled: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Returns true when signalled normally, false when cancelled
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while !state.open && !state.cancelled {
            self.condvar.wait(&mut state);
        }
        !state.cancelled
    }

    /// Open the gate
    pub fn set(&self) {
        self.state.lock().open = true;
        self.condvar.notify_all();
    }

    /// Close the gate
    pub fn reset(&self) {
        self.state.lock().open = false;
    }

    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

impl Default for WaitForEventOrCancel {
    fn default() -> Self {
        Self::new()
    }
}

/// The gate as seen by workers. Bypassed entirely when the pool has a single
/// worker or the idle optimisation is switched off.
#[derive(Debug)]
pub struct WorkerWaitForEventOrCancel {
    gate: WaitForEventOrCancel,
    enabled: bool,
}

impl WorkerWaitForEventOrCancel {
    pub fn new(worker_count: usize, single_worker_when_idle: bool) -> Self {
        Self {
            gate: WaitForEventOrCancel::new(),
            enabled: worker_count > 1 && single_worker_when_idle,
        }
    }

    /// A gate that never blocks
    pub fn bypass() -> Self {
        Self::new(1, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// No-op returning false when bypassed
    pub fn wait(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.gate.wait()
    }

    pub fn set(&self) {
        self.gate.set();
    }

    pub fn reset(&self) {
        if self.enabled {
            self.gate.reset();
        }
    }

    pub fn cancel(&self) {
        self.gate.cancel();
    }

    pub fn is_paused(&self) -> bool {
        !self.gate.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_open_gate_passes() {
        let gate = WaitForEventOrCancel::new();
        assert!(gate.wait());
    }

    #[test]
    fn test_closed_gate_blocks_until_set() {
        let gate = Arc::new(WaitForEventOrCancel::new());
        gate.reset();

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        gate.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_cancel_releases_with_false() {
        let gate = Arc::new(WaitForEventOrCancel::new());
        gate.reset();

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(20));
        gate.cancel();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_bypassed_gate_never_blocks() {
        let single = WorkerWaitForEventOrCancel::new(1, true);
        single.reset();
        assert!(!single.wait());

        let disabled = WorkerWaitForEventOrCancel::new(4, false);
        disabled.reset();
        assert!(!disabled.wait());
        assert!(!disabled.is_paused());
    }

    #[test]
    fn test_enabled_gate_pauses() {
        let gate = WorkerWaitForEventOrCancel::new(4, true);
        assert!(gate.wait());
        gate.reset();
        assert!(gate.is_paused());
        gate.set();
        assert!(!gate.is_paused());
    }
}
