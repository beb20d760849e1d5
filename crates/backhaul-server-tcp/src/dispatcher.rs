//! Forward dispatcher: pairs an accepted public connection with a
//! back-connection from the client that owns the port.

use crate::TcpProxyError;
use backhaul_connection::{swap, SwapConfig, SwapStats};
use backhaul_control::correlation::DEFAULT_CORRELATION_TIMEOUT;
use backhaul_control::{RequestKind, SessionRegistry, TunnelSession};
use backhaul_proto::TargetAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// How long to wait for the client's back-connection
    pub correlation_timeout: Duration,
    pub swap: SwapConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            correlation_timeout: DEFAULT_CORRELATION_TIMEOUT,
            swap: SwapConfig::default(),
        }
    }
}

pub struct ForwardDispatcher {
    registry: Arc<SessionRegistry>,
    session: Arc<TunnelSession>,
    target: TargetAddr,
    remote_port: u16,
    config: DispatchConfig,
    shutdown: CancellationToken,
}

impl ForwardDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        session: Arc<TunnelSession>,
        target: TargetAddr,
        remote_port: u16,
    ) -> Self {
        Self {
            registry,
            session,
            target,
            remote_port,
            config: DispatchConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Token that aborts swaps in progress (relay shutdown)
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Serve one accepted connection until either side closes.
    ///
    /// If no back-connection arrives the public connection is shut down.
    pub async fn dispatch(
        &self,
        mut socket: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<SwapStats, TcpProxyError> {
        let back = match self
            .registry
            .request_stream(
                &self.session,
                RequestKind::Forward,
                self.target.clone(),
                self.config.correlation_timeout,
                Some(&self.shutdown),
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "[Listener:{}] No back-connection for {}: {}",
                    self.remote_port, peer_addr, e
                );
                let _ = socket.shutdown().await;
                return Err(e.into());
            }
        };

        debug!(
            "[Listener:{}] Swapping {} with back-connection to {}",
            self.remote_port, peer_addr, self.target
        );

        let stats = swap(socket, back, self.config.swap, &self.shutdown).await?;
        debug!(
            "[Listener:{}] {} closed ({} bytes in, {} bytes out)",
            self.remote_port, peer_addr, stats.a_to_b, stats.b_to_a
        );
        Ok(stats)
    }
}
