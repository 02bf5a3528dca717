//! Ordered dispatcher registry.
//!
//! # Ordering
//!
//! The chain is an explicit, caller-ordered sequence. `add_head` pushes to
//! the front and `add_tail` to the back; nothing is deduplicated, so a
//! dispatcher registered twice is offered every event twice.
//!
//! # Concurrency
//!
//! The list sits behind a reader-friendly lock and is copy-on-write:
//! delivery clones the current `Arc` and iterates without holding the
//! lock. A dispatcher may therefore register another dispatcher from
//! inside a callback; the delivery in progress keeps the order it started
//! with and the next delivery sees the new one.
//!
//! # Ready signal
//!
//! Insertion reports whether it moved the chain from empty to non-empty.
//! There is no removal, so exactly one insertion over the chain's lifetime
//! returns `true`.

use crate::clock::{Clock, SystemClock};
use crate::dispatch::traits::DispatcherRef;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub struct DispatcherChain {
    dispatchers: RwLock<Arc<Vec<DispatcherRef>>>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl DispatcherChain {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Chain that stamps dispatched messages with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            dispatchers: RwLock::new(Arc::new(Vec::new())),
            clock,
        }
    }

    /// Insert at the front. Returns true if the chain just became ready.
    pub fn add_head(&self, dispatcher: DispatcherRef) -> bool {
        let mut guard = self.dispatchers.write();
        let first = guard.is_empty();
        debug!(dispatcher = dispatcher.name(), position = "head", "adding dispatcher");
        Arc::make_mut(&mut *guard).insert(0, dispatcher);
        first
    }

    /// Insert at the back. Returns true if the chain just became ready.
    pub fn add_tail(&self, dispatcher: DispatcherRef) -> bool {
        let mut guard = self.dispatchers.write();
        let first = guard.is_empty();
        debug!(dispatcher = dispatcher.name(), position = "tail", "adding dispatcher");
        Arc::make_mut(&mut *guard).push(dispatcher);
        first
    }

    /// True iff at least one dispatcher is registered.
    pub fn is_ready(&self) -> bool {
        !self.dispatchers.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.dispatchers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.is_ready()
    }

    /// Current order, frozen for one delivery.
    pub(crate) fn snapshot(&self) -> Arc<Vec<DispatcherRef>> {
        Arc::clone(&*self.dispatchers.read())
    }

    /// Clock used for dispatch stamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Dispatcher names in chain order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|d| d.name().to_string()).collect()
    }
}

impl Default for DispatcherChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatcherChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherChain")
            .field("dispatchers", &self.names())
            .finish()
    }
}
