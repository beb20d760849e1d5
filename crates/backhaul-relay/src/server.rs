//! Relay server: accept loop and connection routing

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::head::{read_request_head, Inbound};
use crate::{public, tunnel};
use backhaul_connection::{BoxedStream, PrefixedStream, SwapConfig};
use backhaul_control::{PortPool, SessionRegistry};
use backhaul_server_tcp::DispatchConfig;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time allowed for a new connection to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared by every connection task
pub(crate) struct RelayContext {
    pub(crate) config: RelayConfig,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) port_pool: Option<Arc<PortPool>>,
    pub(crate) shutdown: CancellationToken,
    back_connections: AtomicU64,
}

impl RelayContext {
    pub(crate) fn swap_config(&self) -> SwapConfig {
        SwapConfig::with_idle_timeout(self.config.idle_timeout)
    }

    pub(crate) fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            correlation_timeout: self.config.correlation_timeout,
            swap: self.swap_config(),
        }
    }
}

pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    port_pool: Option<Arc<PortPool>>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(
            SessionRegistry::new().with_max_pending_per_session(config.max_pending_per_session),
        );
        Self {
            config,
            registry,
            port_pool: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Assign ports to forwards that do not pick their own
    pub fn with_port_pool(mut self, port_pool: Arc<PortPool>) -> Self {
        self.port_pool = Some(port_pool);
        self
    }

    /// Token that stops the server when cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let addr = self.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })
    }

    /// Bind and serve until shut down
    pub async fn run(self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shut down
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        let addr = listener.local_addr()?;
        let ctx = Arc::new(RelayContext {
            config: self.config,
            registry: self.registry,
            port_pool: self.port_pool,
            shutdown: self.shutdown,
            back_connections: AtomicU64::new(0),
        });

        if let Some(pool) = &ctx.port_pool {
            pool.clone().spawn_event_listener(ctx.registry.subscribe());
        }

        info!(
            "Relay listening on {} (web domain {}, forwarding {})",
            addr,
            ctx.config.web_domain,
            if ctx.config.enable_forward { "enabled" } else { "disabled" }
        );

        loop {
            let accepted = tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(ctx, socket, peer_addr).await {
                            debug!("Connection from {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Relay shutting down, disconnecting {} clients", ctx.registry.online_count());
        for session in ctx.registry.sessions() {
            ctx.registry.logout(&session).await;
        }
        Ok(())
    }
}

async fn handle_connection(
    ctx: Arc<RelayContext>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), RelayError> {
    let mut buf = BytesMut::with_capacity(4096);

    let head = match tokio::time::timeout(HEAD_TIMEOUT, read_request_head(&mut socket, &mut buf)).await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(RelayError::HeadTimeout),
    };

    match head.classify()? {
        Inbound::BackConnection(request_id) => {
            let rest = buf.split_off(head.len);
            let stream: BoxedStream = Box::new(PrefixedStream::new(rest.freeze(), socket));
            if ctx.registry.resolve(&request_id, stream) {
                let total = ctx.back_connections.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(request_id = %request_id, "Back-connection from {} matched ({} total)", peer_addr, total);
            } else {
                error!(
                    request_id = %request_id,
                    "Back-connection from {} does not match any pending request",
                    peer_addr
                );
            }
            Ok(())
        }
        Inbound::Tunnel => {
            info!("Tunnel connection from {}", peer_addr);
            tunnel::serve_tunnel(ctx, PrefixedStream::new(buf.freeze(), socket), peer_addr, &head).await
        }
        Inbound::Public => {
            let host = head.host().map(str::to_string);
            if host.is_none() {
                warn!("Request from {} without Host header", peer_addr);
            }
            public::serve_public(ctx, PrefixedStream::new(buf.freeze(), socket), peer_addr, host).await
        }
    }
}
