//! Request head sniffing
//!
//! Every connection to the relay starts with an HTTP/1.x request head. It
//! is read into a buffer and parsed to decide how the connection is served;
//! the buffered bytes are replayed to whoever consumes the stream next.

use crate::error::RelayError;
use backhaul_proto::{parse_back_connection_path, RequestId, BACK_CONNECTION_METHOD, VERSION_HEADER};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum size of a request head (16KB)
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Length of the head in bytes, including the blank line
    pub len: usize,
}

/// How a connection is served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// WebSocket upgrade carrying the protocol version header
    Tunnel,
    /// A client answering a swap request
    BackConnection(RequestId),
    /// Anything else: public traffic routed by Host
    Public,
}

impl RequestHead {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").filter(|h| !h.is_empty())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    pub fn classify(&self) -> Result<Inbound, RelayError> {
        if self.method == BACK_CONNECTION_METHOD {
            return parse_back_connection_path(&self.path)
                .map(Inbound::BackConnection)
                .ok_or_else(|| {
                    RelayError::Protocol(format!("invalid back-connection path {:?}", self.path))
                });
        }

        if self.is_websocket_upgrade() && self.header(VERSION_HEADER).is_some() {
            return Ok(Inbound::Tunnel);
        }

        Ok(Inbound::Public)
    }
}

/// Parse a complete head from `buf`, if one is there
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RelayError::MalformedRequest(e.to_string())),
    };

    Ok(Some(RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        path: request.path.unwrap_or_default().to_string(),
        headers: request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect(),
        len,
    }))
}

/// Read from `stream` into `buf` until a full request head is available.
///
/// Returns `Ok(None)` if the peer closes before sending anything. Bytes
/// past the head stay in `buf`.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Option<RequestHead>, RelayError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            if let Some(head) = parse_head(buf)? {
                return Ok(Some(head));
            }
            if buf.len() >= MAX_HEAD_SIZE {
                return Err(RelayError::HeadTooLarge(MAX_HEAD_SIZE));
            }
        }

        if stream.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(RelayError::MalformedRequest(
                "connection closed mid-head".to_string(),
            ));
        }
    }
}
