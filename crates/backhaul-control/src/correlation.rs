//! Back-connection correlation
//!
//! Asks a client to open a back-connection for a local target and waits
//! for it to arrive. The pending entry is removed on every exit path.

use crate::pending_requests::CorrelationError;
use crate::registry::SessionRegistry;
use crate::session::TunnelSession;
use backhaul_connection::BoxedStream;
use backhaul_proto::{Frame, RequestId, SwapTarget, TargetAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time to wait for a back-connection
pub const DEFAULT_CORRELATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What the back-connection will carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A public HTTP request routed by host
    Web,
    /// A raw TCP connection accepted on a forward port
    Forward,
}

impl RequestKind {
    fn frame(self, target: &SwapTarget) -> Frame {
        match self {
            RequestKind::Web => Frame::swap_request(target),
            RequestKind::Forward => Frame::forward_request(target),
        }
    }
}

impl SessionRegistry {
    /// Request a back-connection from `session` for `target`.
    ///
    /// Sends a SwapRequest or ForwardRequest frame carrying a fresh request
    /// id, then waits until the matching back-connection resolves the
    /// request, `timeout` elapses, `caller` is cancelled, or the session
    /// closes.
    pub async fn request_stream(
        &self,
        session: &Arc<TunnelSession>,
        kind: RequestKind,
        target: TargetAddr,
        timeout: Duration,
        caller: Option<&CancellationToken>,
    ) -> Result<BoxedStream, CorrelationError> {
        if session.is_closed() {
            return Err(CorrelationError::SessionClosed);
        }

        let in_flight = session.begin_request();
        scopeguard::defer! {
            session.end_request();
        }

        if let Some(limit) = self.max_pending_per_session() {
            if in_flight > limit {
                warn!(
                    session_id = %session.id(),
                    "Refusing back-connection request: {} already in flight",
                    limit
                );
                return Err(CorrelationError::TooManyPending { limit });
            }
        }

        let request_id = RequestId::generate();
        let handle = self.pending().create(request_id.clone(), caller)?;
        scopeguard::defer! {
            self.pending().remove(&request_id);
        }

        let swap = SwapTarget::new(request_id.clone(), target);
        debug!(
            session_id = %session.id(),
            request_id = %request_id,
            kind = ?kind,
            "Requesting back-connection for {}",
            swap.target
        );

        // One deadline for queueing the frame and for the wait
        let exchange = async {
            session
                .send(kind.frame(&swap))
                .await
                .map_err(|_| CorrelationError::SessionClosed)?;
            handle.wait(timeout, session.closed_token()).await
        };
        let stream = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| CorrelationError::Timeout(timeout))??;
        debug!(request_id = %request_id, "Back-connection matched");
        Ok(stream)
    }
}
