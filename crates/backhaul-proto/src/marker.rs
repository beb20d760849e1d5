//! Back-connection marker
//!
//! A client answering a swap request opens a fresh connection to the relay
//! and writes an HTTP-shaped head naming the request id:
//!
//! ```text
//! PROXY /{request_id} HTTP/1.1
//! Host: {server_host}:{server_port}
//!
//! ```
//!
//! Every byte after the blank line belongs to the spliced stream.

use crate::frame::RequestId;

/// Request method that marks a back-connection
pub const BACK_CONNECTION_METHOD: &str = "PROXY";

/// Render the marker head for a back-connection
pub fn back_connection_marker(request_id: &RequestId, server_host: &str, server_port: u16) -> String {
    format!(
        "{} /{} HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
        BACK_CONNECTION_METHOD, request_id, server_host, server_port
    )
}

/// Extract the request id from a marker request path (`/{request_id}`)
pub fn parse_back_connection_path(path: &str) -> Option<RequestId> {
    path.strip_prefix('/')?.parse().ok()
}
