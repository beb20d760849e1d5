//! Control plane for tunnel sessions
//!
//! Owns the live state of the relay: connected sessions, the host and port
//! routing tables, the pending back-connection table used to correlate
//! swap requests with the connections that answer them, and the port pool
//! that remembers which public port each named forward was given.
pub mod admin;
pub mod cache;
pub mod correlation;
pub mod listener;
pub mod pending_requests;
pub mod port_pool;
pub mod registry;
pub mod session;

pub use admin::{ClientInfo, ForwardInfo, Listing, WebInfo};
pub use cache::{KeyValueCache, MemoryCache};
pub use correlation::RequestKind;
pub use listener::ListenerHandle;
pub use pending_requests::{CorrelationError, PendingHandle, PendingRequests};
pub use port_pool::{PortPool, PortPoolConfig};
pub use registry::{ForwardEvent, ForwardMapping, SessionRegistry, WebMapping};
pub use session::{SessionError, TunnelSession};
