//! In-process transport for the messenger contract.
//!
//! Endpoints bound to the same [`LoopbackNetwork`] talk to each other
//! through per-endpoint dispatch queues instead of sockets. Handshakes,
//! feature negotiation, authorizer exchange, inbound throttling and
//! reset notification all follow the same rules a socket transport would,
//! which makes this the reference transport for protocol tests.

pub mod connection;
pub mod network;
pub mod transport;
mod worker;

pub use connection::LoopbackConnection;
pub use network::{LoopbackNetwork, DEFAULT_BASE_PORT};
pub use transport::LoopbackTransport;
