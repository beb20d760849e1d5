//! Public TCP port listeners for forwards
//!
//! Each forward a client declares gets its own listener on the relay. Every
//! accepted connection asks the owning client for a back-connection and is
//! then swapped with it.

pub mod dispatcher;
pub mod listener;

pub use dispatcher::{DispatchConfig, ForwardDispatcher};
pub use listener::PortListener;

use backhaul_connection::SwapError;
use backhaul_control::CorrelationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TcpProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Back-connection failed: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("Swap failed: {0}")]
    Swap(#[from] SwapError),
}
