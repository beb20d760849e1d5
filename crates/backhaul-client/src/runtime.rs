//! Control channel lifecycle: connect, log in, dispatch frames, reconnect

use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::error::ClientError;
use crate::handlers::{FrameHandler, LogHandler, SwapHandler};
use backhaul_connection::SwapConfig;
use backhaul_proto::{
    Frame, FrameCodec, FrameType, LoginMessage, PROTOCOL_VERSION, TOKEN_HEADER, VERSION_HEADER,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Connection status of a [`TunnelClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting { attempt: u32 },
    /// WebSocket handshake done, LogIn not yet sent
    LoggingIn,
    /// Control channel open and LogIn sent
    Connected,
    Stopped,
}

pub struct TunnelClient {
    config: Arc<ClientConfig>,
    connector: Connector,
    state: watch::Sender<ClientState>,
    transitions: broadcast::Sender<ClientState>,
}

/// Transitions buffered per subscriber before the oldest are dropped
const TRANSITION_BUFFER: usize = 32;

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let connector = Connector::new(config.server.clone(), config.insecure)?;
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Ok(Self {
            config: Arc::new(config),
            connector,
            state,
            transitions,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Watch connection state changes
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Every state change in order, for observers that must not miss one
    pub fn transitions(&self) -> broadcast::Receiver<ClientState> {
        self.transitions.subscribe()
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
        let _ = self.transitions.send(state);
    }

    /// Keep the tunnel up, reconnecting after a fixed delay, until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.set_state(ClientState::Connecting { attempt });
            info!("Connecting to {} (attempt {})", self.config.server, attempt);

            match self.run_once(&shutdown).await {
                Ok(()) => {
                    attempt = 0;
                    info!("Disconnected from {}", self.config.server);
                }
                Err(e) => error!("Tunnel connection failed: {}", e),
            }
            self.set_state(ClientState::Disconnected);

            if shutdown.is_cancelled() {
                break;
            }
            info!(
                "Reconnecting in {} seconds...",
                self.config.reconnect_delay.as_secs()
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(ClientState::Stopped);
        info!("Tunnel client stopped");
    }

    /// One control channel lifetime: handshake, LogIn, then frames until it closes
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<(), ClientError> {
        let stream = self.connector.connect().await?;

        let mut request = self.config.server.url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static(VERSION_HEADER),
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| ClientError::InvalidConfig(format!("invalid token: {}", e)))?;
            headers.insert(HeaderName::from_static(TOKEN_HEADER), value);
        }

        let (ws, _) = tokio_tungstenite::client_async(request, stream).await?;
        self.set_state(ClientState::LoggingIn);
        let (mut sink, mut source) = ws.split();
        let mut codec = FrameCodec::new();

        let login = Frame::login(&LoginMessage {
            webs: self.config.webs.clone(),
            forwards: self.config.forwards.clone(),
        })?;
        sink.send(Message::Binary(codec.encode_frame(login)?.to_vec()))
            .await?;
        self.set_state(ClientState::Connected);
        info!(
            "Logged in to {} with {} webs and {} forwards",
            self.config.server,
            self.config.webs.len(),
            self.config.forwards.len()
        );

        // Swaps outlive a dropped control channel but not a shutdown
        let swap_handler = SwapHandler::new(
            self.connector.clone(),
            SwapConfig::with_idle_timeout(self.config.idle_timeout),
            shutdown.clone(),
        );
        let log_handler = LogHandler;

        let mut buf = BytesMut::new();
        loop {
            let message = tokio::select! {
                message = source.next() => message,
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            };

            let data = match message {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(_)) => continue,
            };

            buf.extend_from_slice(&data);
            while let Some(frame) = codec.decode(&mut buf)? {
                let handler: &dyn FrameHandler = match frame.frame_type {
                    FrameType::SwapRequest | FrameType::ForwardRequest => &swap_handler,
                    FrameType::Log => &log_handler,
                    FrameType::LogIn => {
                        warn!("Ignoring LogIn frame sent by the server");
                        continue;
                    }
                };
                if let Err(e) = handler.handle(frame) {
                    warn!("Failed to handle frame: {}", e);
                }
            }
        }
    }
}
