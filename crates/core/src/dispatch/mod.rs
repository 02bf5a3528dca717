//! Dispatcher chain and the delivery protocol over it.
//!
//! Protocol engines implement [`Dispatcher`] and register on a
//! [`DispatcherChain`]; transports call the chain's `deliver_*` entry
//! points whenever a transport-level event happens.

pub mod chain;
pub mod delivery;
pub mod traits;

pub use chain::DispatcherChain;
pub use traits::{Dispatched, Dispatcher, DispatcherRef};
