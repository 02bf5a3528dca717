//! Shared in-flight budget referenced by connection policies.
//!
//! A [`Throttle`] is shared through `Arc` by every policy that points at
//! it; it lives as long as its longest holder. The messenger layer only
//! carries the reference. Whether a producer blocks or gets rejected is
//! the transport's call: [`Throttle::take`] blocks, [`Throttle::try_take`]
//! does not.

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Counting budget (typically bytes or messages).
#[derive(Debug)]
pub struct Throttle {
    name: String,
    max: u64,
    current: Mutex<u64>,
    cond: Condvar,
}

impl Throttle {
    /// Create a throttle admitting up to `max` units. `max == 0` disables it.
    pub fn new(name: impl Into<String>, max: u64) -> Self {
        Self {
            name: name.into(),
            max,
            current: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Units currently held.
    pub fn current(&self) -> u64 {
        *self.current.lock()
    }

    fn admits(&self, current: u64, count: u64) -> bool {
        // An oversized request still goes through once the budget is idle.
        self.max == 0 || current.saturating_add(count) <= self.max || current == 0
    }

    /// Take `count` units, blocking until they fit.
    pub fn take(&self, count: u64) {
        let mut current = self.current.lock();
        while !self.admits(*current, count) {
            trace!(throttle = %self.name, current = *current, count, "waiting for budget");
            self.cond.wait(&mut current);
        }
        *current = current.saturating_add(count);
    }

    /// Take `count` units if they fit right now.
    pub fn try_take(&self, count: u64) -> bool {
        let mut current = self.current.lock();
        if !self.admits(*current, count) {
            return false;
        }
        *current = current.saturating_add(count);
        true
    }

    /// Return `count` units and wake waiters.
    pub fn put(&self, count: u64) {
        let mut current = self.current.lock();
        *current = current.saturating_sub(count);
        self.cond.notify_all();
    }
}
