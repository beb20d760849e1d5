//! Pending back-connection table
//!
//! Each swap/forward request sent to a client registers an entry keyed by
//! its request id. The back-connection that later arrives with the same id
//! resolves the entry and the stream is handed to the waiter.

use backhaul_connection::BoxedStream;
use backhaul_proto::RequestId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("No back-connection arrived within {0:?}")]
    Timeout(Duration),

    #[error("Tunnel session closed")]
    SessionClosed,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request id {0} is already pending")]
    DuplicateRequest(RequestId),

    #[error("Too many in-flight requests for this session (limit {limit})")]
    TooManyPending { limit: usize },
}

struct PendingEntry {
    tx: oneshot::Sender<BoxedStream>,
    cancel: CancellationToken,
    created_at: Instant,
}

/// Waiting side of a pending request
pub struct PendingHandle {
    id: RequestId,
    rx: oneshot::Receiver<BoxedStream>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PendingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandle").field("id", &self.id).finish()
    }
}

impl PendingHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the back-connection.
    ///
    /// Fails on timeout, when the entry is cancelled (directly or through
    /// the caller's token), or when `session_closed` fires.
    pub async fn wait(
        self,
        timeout: Duration,
        session_closed: &CancellationToken,
    ) -> Result<BoxedStream, CorrelationError> {
        let PendingHandle { id, rx, cancel } = self;

        tokio::select! {
            result = rx => result.map_err(|_| CorrelationError::Cancelled),
            _ = cancel.cancelled() => Err(CorrelationError::Cancelled),
            _ = session_closed.cancelled() => Err(CorrelationError::SessionClosed),
            _ = tokio::time::sleep(timeout) => {
                debug!(request_id = %id, "Back-connection timed out after {:?}", timeout);
                Err(CorrelationError::Timeout(timeout))
            }
        }
    }
}

/// Tracks requests awaiting a back-connection
#[derive(Clone)]
pub struct PendingRequests {
    requests: Arc<DashMap<RequestId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request.
    ///
    /// The entry's cancellation token is a child of `parent` when given, so
    /// cancelling the caller also cancels the wait.
    pub fn create(
        &self,
        id: RequestId,
        parent: Option<&CancellationToken>,
    ) -> Result<PendingHandle, CorrelationError> {
        let cancel = parent
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (tx, rx) = oneshot::channel();

        match self.requests.entry(id.clone()) {
            Entry::Occupied(_) => return Err(CorrelationError::DuplicateRequest(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    tx,
                    cancel: cancel.clone(),
                    created_at: Instant::now(),
                });
            }
        }

        debug!(request_id = %id, "Registered pending request");
        Ok(PendingHandle { id, rx, cancel })
    }

    /// Hand a back-connection to the waiter registered under `id`.
    ///
    /// Returns false if no such request is pending or its waiter is gone;
    /// the stream is dropped (and so closed) in that case.
    pub fn resolve(&self, id: &RequestId, stream: BoxedStream) -> bool {
        let Some((_, entry)) = self.requests.remove(id) else {
            warn!(request_id = %id, "No pending request for back-connection");
            return false;
        };

        debug!(
            request_id = %id,
            "Resolving pending request after {:?}",
            entry.created_at.elapsed()
        );
        if entry.tx.send(stream).is_err() {
            warn!(request_id = %id, "Back-connection arrived after the waiter gave up");
            return false;
        }
        true
    }

    /// Cancel a pending request, waking its waiter with an error
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.requests.remove(id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(request_id = %id, "Cancelled pending request");
                true
            }
            None => false,
        }
    }

    /// Remove a pending request without waking its waiter
    pub fn remove(&self, id: &RequestId) -> bool {
        self.requests.remove(id).is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.requests.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
