//! Backhaul Protocol Definitions
//!
//! Wire types shared by the relay and the tunnel client: the line-oriented
//! control frames, the JSON login payload, swap/forward request payloads,
//! the back-connection marker and the handshake headers.

pub mod codec;
pub mod frame;
pub mod handshake;
pub mod marker;
pub mod messages;

pub use codec::FrameCodec;
pub use frame::{Frame, FrameError, FrameType, RequestId, SwapTarget, TargetAddr};
pub use handshake::{
    validate_handshake, HandshakeRejection, PROTOCOL_VERSION, TOKEN_HEADER, VERSION_HEADER,
};
pub use marker::{back_connection_marker, parse_back_connection_path, BACK_CONNECTION_METHOD};
pub use messages::{ForwardConfig, LoginMessage, WebConfig};

/// Maximum length of a single control frame line (64KB)
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;
