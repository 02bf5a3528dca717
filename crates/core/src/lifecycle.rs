//! Start/shutdown state machine.
//!
//! ```text
//! Created --start--> Started --shutdown--> Stopping --wait--> Stopped
//!    \______________________shutdown_________/
//! ```
//!
//! `Stopping` is the window between a teardown request and its
//! completion. Only a transport wait that actually joined its delivery
//! context moves it on to `Stopped`.

use parking_lot::Mutex;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Created),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    /// Created -> Started. Returns false if not in Created.
    pub fn mark_started(&self) -> bool {
        let mut state = self.state.lock();
        if *state != LifecycleState::Created {
            return false;
        }
        *state = LifecycleState::Started;
        true
    }

    /// Created/Started -> Stopping. Returns the previous state.
    pub fn begin_shutdown(&self) -> LifecycleState {
        let mut state = self.state.lock();
        let prev = *state;
        if matches!(prev, LifecycleState::Created | LifecycleState::Started) {
            *state = LifecycleState::Stopping;
        }
        prev
    }

    /// Any -> Stopped.
    pub fn mark_stopped(&self) {
        *self.state.lock() = LifecycleState::Stopped;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
