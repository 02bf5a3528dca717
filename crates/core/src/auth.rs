//! Authorizer blobs exchanged while securing a peer link.
//!
//! The messenger layer only routes these between dispatchers and the
//! transport. Building and checking credentials is the dispatchers' job.

use bytes::Bytes;

/// Opaque credential produced by one side and verified by the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorizer {
    /// Authentication protocol identifier.
    pub protocol: u32,
    pub payload: Bytes,
}

impl Authorizer {
    pub fn new(protocol: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol,
            payload: payload.into(),
        }
    }
}

/// Definitive answer from a dispatcher that recognised an authorizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthVerdict {
    pub valid: bool,
    /// Reply blob returned to the connecting peer.
    pub reply: Bytes,
}

impl AuthVerdict {
    pub fn accept(reply: impl Into<Bytes>) -> Self {
        Self {
            valid: true,
            reply: reply.into(),
        }
    }

    pub fn reject() -> Self {
        Self {
            valid: false,
            reply: Bytes::new(),
        }
    }
}
