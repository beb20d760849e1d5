//! TCP listener for a single forward port

use crate::dispatcher::ForwardDispatcher;
use crate::TcpProxyError;
use backhaul_control::ListenerHandle;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub struct PortListener {
    listener: TcpListener,
    handle: ListenerHandle,
}

impl PortListener {
    /// Bind `bind_addr`, retrying briefly while the port is in TIME_WAIT
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, TcpProxyError> {
        let listener = bind_with_retry(bind_addr).await?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            listener,
            handle: ListenerHandle::new(port),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TcpProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn port(&self) -> u16 {
        self.handle.port()
    }

    /// Handle to stop this listener once it is running
    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Run the accept loop in the background until the handle is stopped
    pub fn spawn(self, dispatcher: Arc<ForwardDispatcher>) -> ListenerHandle {
        let handle = self.handle.clone();
        let task = tokio::spawn(self.run(dispatcher));
        handle.attach(task);
        handle
    }

    async fn run(self, dispatcher: Arc<ForwardDispatcher>) {
        let port = self.handle.port();
        let shutdown = self.handle.shutdown_token();
        let in_flight = self.handle.in_flight_counter();

        info!("[Listener:{}] Listening", port);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    let clients = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        "[Listener:{}] Accepted {}. There are {} clients connected",
                        port, peer_addr, clients
                    );

                    let dispatcher = dispatcher.clone();
                    let in_flight = in_flight.clone();
                    tokio::spawn(async move {
                        scopeguard::defer! {
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                        if let Err(e) = dispatcher.dispatch(socket, peer_addr).await {
                            debug!("[Listener:{}] Connection from {} ended: {}", port, peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("[Listener:{}] Failed to accept connection: {}", port, e);
                }
            }
        }

        info!("[Listener:{}] Stopped", port);
    }
}

async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, TcpProxyError> {
    for attempt in 1..=3 {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/3",
                        bind_addr, attempt
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                    bind_addr.port(),
                    attempt
                );
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(TcpProxyError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(TcpProxyError::BindError {
        address: bind_addr.ip().to_string(),
        port: bind_addr.port(),
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}
