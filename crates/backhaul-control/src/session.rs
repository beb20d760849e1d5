//! A connected tunnel client

use backhaul_proto::Frame;
use chrono::{DateTime, Local};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(Uuid),
}

/// A logged-in client and the outbound side of its control channel.
///
/// Frames queued with [`TunnelSession::send`] are written to the client by
/// the connection's writer task in the order they were queued.
#[derive(Debug)]
pub struct TunnelSession {
    id: Uuid,
    remote_addr: SocketAddr,
    started_at: DateTime<Local>,
    frames: mpsc::Sender<Frame>,
    closed: CancellationToken,
    in_flight: AtomicUsize,
    /// Hosts registered on behalf of this session
    hosts: Mutex<Vec<String>>,
    /// Public ports registered on behalf of this session
    forward_ports: Mutex<Vec<u16>>,
}

impl TunnelSession {
    pub fn new(remote_addr: SocketAddr, frames: mpsc::Sender<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            started_at: Local::now(),
            frames,
            closed: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            hosts: Mutex::new(Vec::new()),
            forward_ports: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Queue a frame for the client
    pub async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed(self.id));
        }
        debug!(session_id = %self.id, frame_type = ?frame.frame_type, "Queueing frame");
        self.frames
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed(self.id))
    }

    /// Queue a Log frame, ignoring a closed session
    pub async fn log(&self, text: impl AsRef<str>) {
        let _ = self.send(Frame::log(text)).await;
    }

    /// Mark the session closed. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.frames.is_closed()
    }

    /// Token cancelled when the session closes
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Back-connection requests currently awaiting an answer
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_request(&self) -> usize {
        self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_host(&self, host: &str) {
        if let Ok(mut hosts) = self.hosts.lock() {
            if !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }
    }

    pub(crate) fn record_forward(&self, port: u16) {
        if let Ok(mut ports) = self.forward_ports.lock() {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
    }

    pub(crate) fn forget_forward(&self, port: u16) {
        if let Ok(mut ports) = self.forward_ports.lock() {
            ports.retain(|p| *p != port);
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn forward_ports(&self) -> Vec<u16> {
        self.forward_ports
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub(crate) fn take_hosts(&self) -> Vec<String> {
        self.hosts
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default()
    }

    pub(crate) fn take_forward_ports(&self) -> Vec<u16> {
        self.forward_ports
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }
}
