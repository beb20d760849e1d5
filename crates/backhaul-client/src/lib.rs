//! Backhaul tunnel client
//!
//! Keeps a control channel open to a relay, declares the local web and
//! TCP services to expose, and answers the relay's swap requests by
//! opening back-connections spliced to those local services.

pub mod config;
pub mod connector;
pub mod error;
pub mod handlers;
pub mod runtime;

pub use config::{ClientConfig, ClientConfigBuilder, ServerEndpoint, ServerProtocol};
pub use connector::Connector;
pub use error::ClientError;
pub use handlers::{FrameHandler, LogHandler, SwapHandler};
pub use runtime::{ClientState, TunnelClient};
