//! Stream plumbing for tunnel traffic
//!
//! Provides the type-erased duplex stream handed between the relay's
//! listeners and the correlation layer, a stream that replays bytes already
//! consumed while sniffing a connection, and the bidirectional swap that
//! splices two streams together.

pub mod stream;
pub mod swap;

pub use stream::{BoxedStream, DuplexStream, PrefixedStream};
pub use swap::{swap, SwapConfig, SwapError, SwapStats};
