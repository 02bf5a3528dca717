//! Builder for [`Messenger`].

use crate::clock::{Clock, SystemClock};
use crate::config::MessengerConfig;
use crate::dispatch::DispatcherChain;
use crate::entity::EntityName;
use crate::error::Result;
use crate::message::PRIO_DEFAULT;
use crate::messenger::{Messenger, MessengerHandle};
use crate::transport::Transport;
use std::sync::Arc;

/// Builder for a messenger and its transport.
///
/// The transport is constructed last, from the shared handle, so it can
/// deliver into the same chain the messenger registers dispatchers on.
///
/// # Example
///
/// ```ignore
/// let msgr = MessengerBuilder::new(EntityName::osd(0))
///     .with_default_send_priority(PRIO_HIGH)
///     .build(|handle| LoopbackTransport::bind(&network, handle, policies))?;
/// ```
pub struct MessengerBuilder {
    name: EntityName,
    default_send_priority: i32,
    clock: Arc<dyn Clock>,
}

impl MessengerBuilder {
    pub fn new(name: EntityName) -> Self {
        Self {
            name,
            default_send_priority: PRIO_DEFAULT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Builder seeded from `config`.
    pub fn from_config(name: EntityName, config: &MessengerConfig) -> Self {
        Self::new(name).with_default_send_priority(config.default_send_priority)
    }

    pub fn with_default_send_priority(mut self, priority: i32) -> Self {
        self.default_send_priority = priority;
        self
    }

    /// Clock used to stamp messages at dispatch.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build<T, F>(self, make_transport: F) -> Result<Messenger<T>>
    where
        T: Transport,
        F: FnOnce(Arc<MessengerHandle>) -> Result<T>,
    {
        let chain = DispatcherChain::with_clock(self.clock);
        let handle = Arc::new(MessengerHandle::new(self.name, chain));
        let transport = make_transport(Arc::clone(&handle))?;
        Ok(Messenger::from_parts(
            handle,
            self.default_send_priority,
            transport,
        ))
    }
}
