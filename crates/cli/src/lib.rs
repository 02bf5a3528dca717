//! Command-line driver for the messenger layer.
//!
//! Provides commands for:
//! - Running a ping/pong exchange over the loopback transport
//! - Inspecting the policy a configuration resolves for a peer type
//! - Decoding feature bit masks

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
