//! Dispatcher capability contract.

use crate::auth::{AuthVerdict, Authorizer};
use crate::connection::ConnectionRef;
use crate::entity::EntityType;
use crate::message::Message;
use std::sync::Arc;

/// Outcome of offering a message to a dispatcher.
///
/// Claiming consumes the message; declining hands it back so the next
/// dispatcher in the chain can be offered the same message.
#[derive(Debug)]
pub enum Dispatched {
    Claimed,
    Declined(Message),
}

/// A protocol engine registered with a messenger.
///
/// Every callback runs synchronously on a transport-owned execution
/// context and must return before delivery moves on.
pub trait Dispatcher: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Offer an inbound message.
    fn on_dispatch(&self, msg: Message) -> Dispatched;

    /// A connection to a peer was established. Broadcast to every dispatcher.
    fn on_connect(&self, _con: &ConnectionRef) {}

    /// Our side of a connection was reset. Returns true to stop propagation.
    fn on_reset(&self, _con: &ConnectionRef) -> bool {
        false
    }

    /// The peer reset its session. Broadcast to every dispatcher.
    fn on_remote_reset(&self, _con: &ConnectionRef) {}

    /// Produce an authorizer for connecting to a `peer_type` peer.
    fn issue_authorizer(&self, _peer_type: EntityType, _force_new: bool) -> Option<Authorizer> {
        None
    }

    /// Check an authorizer presented by an incoming peer.
    ///
    /// `None` means "not mine"; `Some` is a definitive verdict.
    fn verify_authorizer(
        &self,
        _con: &ConnectionRef,
        _peer_type: EntityType,
        _protocol: u32,
        _authorizer: &[u8],
    ) -> Option<AuthVerdict> {
        None
    }
}

/// Shared handle to a registered dispatcher.
pub type DispatcherRef = Arc<dyn Dispatcher>;
