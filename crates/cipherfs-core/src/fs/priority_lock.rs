//! Two-lane fairness primitive for per-file scheduling.
//!
//! Streaming reads and writes take *regular* tokens, which dispense
//! immediately and run concurrently. Whole-file operations (truncate, close,
//! move) take *priority* tokens: as soon as one is requested, no new regular
//! tokens are issued; once the outstanding regular tokens are redeemed, all
//! pending priority tokens run (concurrently with each other), and the lock
//! reverts to the regular state when the last one is redeemed.
//!
//! This prevents whole-file operations from starving behind a steady stream
//! of chunk I/O without serializing unrelated regular operations against
//! each other.

use std::sync::{Condvar, Mutex};

/// Token dispenser with two lanes and anti-starvation hand-off.
#[derive(Debug, Default)]
pub struct PriorityMutex {
    state: Mutex<LockState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    active_regular: usize,
    active_priority: usize,
    pending_priority: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenClass {
    Regular,
    Priority,
}

/// A dispensed token; redeemed (released) on drop.
#[derive(Debug)]
pub struct PriorityMutexToken<'a> {
    lock: &'a PriorityMutex,
    class: TokenClass,
}

impl PriorityMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a regular token, blocking while any priority request is
    /// pending or active.
    pub fn dispense_regular(&self) -> PriorityMutexToken<'_> {
        let mut state = self.state.lock().unwrap();
        while state.pending_priority > 0 || state.active_priority > 0 {
            state = self.changed.wait(state).unwrap();
        }
        state.active_regular += 1;
        PriorityMutexToken {
            lock: self,
            class: TokenClass::Regular,
        }
    }

    /// Obtain a priority token, blocking until the currently outstanding
    /// regular tokens are redeemed. Other priority holders do not block
    /// each other.
    pub fn dispense_priority(&self) -> PriorityMutexToken<'_> {
        let mut state = self.state.lock().unwrap();
        state.pending_priority += 1;
        while state.active_regular > 0 {
            state = self.changed.wait(state).unwrap();
        }
        state.pending_priority -= 1;
        state.active_priority += 1;
        PriorityMutexToken {
            lock: self,
            class: TokenClass::Priority,
        }
    }
}

impl Drop for PriorityMutexToken<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        match self.class {
            TokenClass::Regular => state.active_regular -= 1,
            TokenClass::Priority => state.active_priority -= 1,
        }
        self.lock.changed.notify_all();
    }
}
