//! Backhaul relay
//!
//! A single public endpoint that serves three kinds of connections:
//!
//! - tunnel clients upgrading to a WebSocket control channel,
//! - back-connections (`PROXY /{request_id}`) answering swap requests,
//! - public HTTP requests, routed to a client by their Host header.
//!
//! Forward ports declared by clients get their own listeners.

pub mod config;
pub mod error;
pub mod head;
mod login;
mod public;
pub mod server;
mod tunnel;

pub use config::RelayConfig;
pub use error::RelayError;
pub use server::RelayServer;
