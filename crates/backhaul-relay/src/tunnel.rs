//! Tunnel control channel: handshake, frame reader and frame writer

use crate::error::RelayError;
use crate::head::RequestHead;
use crate::login;
use crate::server::RelayContext;
use backhaul_connection::PrefixedStream;
use backhaul_control::TunnelSession;
use backhaul_proto::{validate_handshake, Frame, FrameCodec, FrameType, TOKEN_HEADER, VERSION_HEADER};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type TunnelSocket = WebSocketStream<PrefixedStream<TcpStream>>;

/// Frames queued per session before senders wait
const FRAME_QUEUE: usize = 256;

/// Serve a tunnel client from its WebSocket upgrade until it disconnects
pub(crate) async fn serve_tunnel(
    ctx: Arc<RelayContext>,
    stream: PrefixedStream<TcpStream>,
    peer_addr: SocketAddr,
    head: &RequestHead,
) -> Result<(), RelayError> {
    let version = head.header(VERSION_HEADER).map(str::to_string);
    let token = head.header(TOKEN_HEADER).map(str::to_string);

    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, source) = ws.split();

    if let Err(rejection) =
        validate_handshake(version.as_deref(), token.as_deref(), &ctx.config.tokens)
    {
        warn!("Rejected tunnel from {}: {}", peer_addr, rejection);
        let frame = FrameCodec::new().encode_frame(Frame::log(rejection.to_string()))?;
        sink.send(Message::Binary(frame.to_vec())).await?;
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
    }

    let (tx, rx) = mpsc::channel(FRAME_QUEUE);
    let session = Arc::new(TunnelSession::new(peer_addr, tx));
    ctx.registry.login(session.clone());

    let writer = tokio::spawn(write_frames(
        sink,
        rx,
        session.closed_token().clone(),
        ctx.shutdown.clone(),
    ));

    let result = read_frames(&ctx, &session, source).await;
    if let Err(e) = &result {
        warn!(session_id = %session.id(), "Tunnel from {} failed: {}", peer_addr, e);
    }

    ctx.registry.logout(&session).await;
    let _ = writer.await;
    result
}

async fn write_frames(
    mut sink: SplitSink<TunnelSocket, Message>,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut codec = FrameCodec::new();

    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = closed.cancelled() => None,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        let bytes = match codec.encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping frame that cannot be encoded: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Binary(bytes.to_vec())).await {
            debug!("Control channel write failed: {}", e);
            break;
        }
    }

    // Wake the reader if the writer ended first
    closed.cancel();
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn read_frames(
    ctx: &Arc<RelayContext>,
    session: &Arc<TunnelSession>,
    mut source: SplitStream<TunnelSocket>,
) -> Result<(), RelayError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let closed = session.closed_token().clone();

    loop {
        let message = tokio::select! {
            message = source.next() => message,
            _ = closed.cancelled() => return Ok(()),
            _ = ctx.shutdown.cancelled() => return Ok(()),
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
            handle_frame(ctx, session, frame).await;
        }
    }
}

async fn handle_frame(ctx: &Arc<RelayContext>, session: &Arc<TunnelSession>, frame: Frame) {
    match frame.frame_type {
        FrameType::LogIn => match frame.login_message() {
            Ok(message) => login::handle_login(ctx, session, message).await,
            Err(e) => {
                warn!(session_id = %session.id(), "Invalid login payload: {}", e);
                session.log(format!("Invalid login: {}", e)).await;
            }
        },
        FrameType::Log => {
            info!(session_id = %session.id(), "Client says: {}", frame.payload);
        }
        FrameType::SwapRequest | FrameType::ForwardRequest => {
            warn!(
                session_id = %session.id(),
                "Ignoring {:?} frame sent by a client",
                frame.frame_type
            );
        }
    }
}
