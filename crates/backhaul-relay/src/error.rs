use backhaul_connection::SwapError;
use backhaul_control::CorrelationError;
use backhaul_proto::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Timed out waiting for request head")]
    HeadTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Back-connection failed: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("Swap failed: {0}")]
    Swap(#[from] SwapError),
}
