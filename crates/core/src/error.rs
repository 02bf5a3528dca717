//! Error types for the messenger layer.
//!
//! Only recoverable failures live here. Programming errors (mutating the
//! send priority after start, an inbound message nobody claims) are
//! faults and panic instead of returning a status.

use crate::connection::ConnectionId;
use crate::entity::{EntityAddr, EntityType};
use crate::features::FeatureSet;
use thiserror::Error;

/// Result type alias for messenger operations.
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Errors returned by lifecycle, send and connection operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessengerError {
    /// The transport does not implement this operation.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The messenger has not been started yet.
    #[error("messenger not started")]
    NotStarted,

    /// The messenger is shutting down or already stopped.
    #[error("messenger is shut down")]
    ShutDown,

    /// No peer is bound at the destination address.
    #[error("connection refused by {0}")]
    ConnectionRefused(EntityAddr),

    /// The connection was marked down and can no longer carry traffic.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The connection handle does not belong to this transport.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Handshake rejected: the peer lacks features our policy requires.
    #[error("peer {peer} is missing required features {missing}")]
    FeatureMismatch {
        peer: EntityAddr,
        missing: FeatureSet,
    },

    /// No dispatcher produced an authorizer or a positive verification.
    #[error("authentication failed with {peer_type} peer: {reason}")]
    AuthFailed {
        peer_type: EntityType,
        reason: String,
    },

    /// Address could not be bound.
    #[error("bind failed: {0}")]
    Bind(String),

    /// The transport could not start its execution context.
    #[error("worker failed to start: {0}")]
    Worker(String),

    /// Configuration could not be loaded or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MessengerError {
    /// Short name of the failure kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            MessengerError::NotSupported(_) => "not_supported",
            MessengerError::NotStarted => "not_started",
            MessengerError::ShutDown => "shut_down",
            MessengerError::ConnectionRefused(_) => "connection_refused",
            MessengerError::ConnectionClosed(_) => "connection_closed",
            MessengerError::UnknownConnection(_) => "unknown_connection",
            MessengerError::FeatureMismatch { .. } => "feature_mismatch",
            MessengerError::AuthFailed { .. } => "auth_failed",
            MessengerError::Bind(_) => "bind",
            MessengerError::Worker(_) => "worker",
            MessengerError::Config(_) => "config",
        }
    }
}
