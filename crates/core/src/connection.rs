//! Opaque connection handles.
//!
//! A connection is one logical peer session. Its lifetime belongs to the
//! transport; dispatchers and protocol engines only hold references.

use crate::entity::{EntityAddr, EntityType};
use crate::features::FeatureSet;
use std::fmt;
use std::sync::Arc;

/// Transport-assigned connection identifier.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "con#{}", self.0)
    }
}

/// One logical peer session, implemented by the concrete transport.
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    fn peer_addr(&self) -> EntityAddr;

    fn peer_type(&self) -> EntityType;

    /// Features negotiated with the peer at handshake.
    fn features(&self) -> FeatureSet;

    /// False once the connection has been marked down.
    fn is_connected(&self) -> bool;

    fn has_feature(&self, feature: FeatureSet) -> bool {
        self.features().contains(feature)
    }
}

/// Shared, non-exclusive reference to a transport-owned connection.
pub type ConnectionRef = Arc<dyn Connection>;
