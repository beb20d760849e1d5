use backhaul_connection::SwapError;
use backhaul_proto::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to server {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Local target {address} unreachable: {source}")]
    TargetUnreachable {
        address: String,
        source: std::io::Error,
    },

    #[error("Invalid server URL: {0}")]
    InvalidServerUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Swap failed: {0}")]
    Swap(#[from] SwapError),
}
