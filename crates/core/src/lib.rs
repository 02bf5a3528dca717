//! Core peer-messaging contract for a storage cluster node.
//!
//! This crate fixes the rules every transport and every protocol engine
//! share, independent of how bytes move:
//! - Entity identity and addressing
//! - Connection policies and feature negotiation bits
//! - The ordered dispatcher chain and its delivery protocol
//! - The transport facade concrete transports implement
//! - The messenger lifecycle (start, shutdown, wait)

pub mod auth;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod features;
pub mod lifecycle;
pub mod message;
pub mod messenger;
pub mod policy;
pub mod throttle;
pub mod transport;

pub use auth::{AuthVerdict, Authorizer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MessengerConfig, PolicyConfig, PolicyRole};
pub use connection::{Connection, ConnectionId, ConnectionRef};
pub use dispatch::{Dispatched, Dispatcher, DispatcherChain, DispatcherRef};
pub use entity::{EntityAddr, EntityInst, EntityName, EntityType};
pub use error::{MessengerError, Result};
pub use features::FeatureSet;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use message::{Message, MessageHeader, PRIO_DEFAULT, PRIO_HIGH, PRIO_HIGHEST, PRIO_LOW};
pub use messenger::{Messenger, MessengerBuilder, MessengerHandle};
pub use policy::{Policy, PolicySet};
pub use throttle::Throttle;
pub use transport::Transport;
