//! Control frames exchanged over a tunnel session

use crate::messages::LoginMessage;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Unknown frame type: {0:#04x}")]
    UnknownType(u8),

    #[error("Frame payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame payload contains a line terminator")]
    EmbeddedNewline,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid swap payload: {0}")]
    InvalidSwapPayload(String),

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected {expected:?} frame, got {actual:?}")]
    UnexpectedType {
        expected: FrameType,
        actual: FrameType,
    },
}

/// Control frame discriminator, encoded as the first byte of a frame line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Client -> server: JSON declaration of webs and forwards
    LogIn = 1,
    /// Server -> client: open a back-connection for a public HTTP request
    SwapRequest = 2,
    /// Server -> client: open a back-connection for a forwarded TCP connection
    ForwardRequest = 3,
    /// Server -> client: free text for the client's log
    Log = 4,
}

impl FrameType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameType::LogIn),
            2 => Some(FrameType::SwapRequest),
            3 => Some(FrameType::ForwardRequest),
            4 => Some(FrameType::Log),
            _ => None,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte).ok_or(FrameError::UnknownType(byte))
    }
}

/// A single control frame: `[type byte][utf-8 payload]\n` on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: String,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<String>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Build a LogIn frame carrying the JSON login declaration
    pub fn login(message: &LoginMessage) -> Result<Self, FrameError> {
        Ok(Self::new(FrameType::LogIn, serde_json::to_string(message)?))
    }

    pub fn swap_request(target: &SwapTarget) -> Self {
        Self::new(FrameType::SwapRequest, target.to_string())
    }

    pub fn forward_request(target: &SwapTarget) -> Self {
        Self::new(FrameType::ForwardRequest, target.to_string())
    }

    /// Build a Log frame. Line breaks in `text` are flattened to spaces.
    pub fn log(text: impl AsRef<str>) -> Self {
        let text = text.as_ref().replace("\r\n", " ").replace(['\r', '\n'], " ");
        Self::new(FrameType::Log, text)
    }

    /// Parse the payload of a LogIn frame
    pub fn login_message(&self) -> Result<LoginMessage, FrameError> {
        if self.frame_type != FrameType::LogIn {
            return Err(FrameError::UnexpectedType {
                expected: FrameType::LogIn,
                actual: self.frame_type,
            });
        }
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Parse the payload of a SwapRequest or ForwardRequest frame
    pub fn swap_target(&self) -> Result<SwapTarget, FrameError> {
        match self.frame_type {
            FrameType::SwapRequest | FrameType::ForwardRequest => self.payload.parse(),
            actual => Err(FrameError::UnexpectedType {
                expected: FrameType::SwapRequest,
                actual,
            }),
        }
    }
}

/// Correlation id shared by a swap request and its back-connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh 128-bit random id rendered as 32 hex digits
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty()
            || s
                .chars()
                .any(|c| c == '|' || c == '/' || c.is_whitespace() || c.is_control())
        {
            return Err(FrameError::InvalidSwapPayload(format!(
                "invalid request id {:?}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }
}

/// A `host:port` pair naming a local target behind the client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TargetAddr {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| FrameError::InvalidTarget(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(FrameError::InvalidTarget(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| FrameError::InvalidTarget(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Payload of SwapRequest/ForwardRequest frames: `requestId|host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapTarget {
    pub request_id: RequestId,
    pub target: TargetAddr,
}

impl SwapTarget {
    pub fn new(request_id: RequestId, target: TargetAddr) -> Self {
        Self { request_id, target }
    }
}

impl fmt::Display for SwapTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.request_id, self.target)
    }
}

impl FromStr for SwapTarget {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, target) = s
            .split_once('|')
            .ok_or_else(|| FrameError::InvalidSwapPayload(s.to_string()))?;
        Ok(Self {
            request_id: id.parse()?,
            target: target.parse()?,
        })
    }
}
