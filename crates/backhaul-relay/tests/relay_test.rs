//! Relay tests driving the control channel by hand
//!
//! The tunnel side is a bare WebSocket client so each frame exchanged with
//! the relay can be asserted on directly.

use backhaul_control::SessionRegistry;
use backhaul_proto::{
    back_connection_marker, ForwardConfig, Frame, FrameCodec, FrameType, LoginMessage,
    SwapTarget, WebConfig, PROTOCOL_VERSION, TOKEN_HEADER, VERSION_HEADER,
};
use backhaul_relay::{RelayConfig, RelayServer};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_relay(config: RelayConfig) -> TestRelay {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = RelayServer::new(config);
    let registry = server.registry();
    let shutdown = server.shutdown_token();
    tokio::spawn(server.serve(listener));

    TestRelay {
        addr,
        registry,
        shutdown,
    }
}

fn forward_config() -> RelayConfig {
    RelayConfig {
        forward_bind_ip: "127.0.0.1".parse().unwrap(),
        ..RelayConfig::default()
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Hand-driven tunnel client
struct RawTunnel {
    ws: WebSocketStream<TcpStream>,
    codec: FrameCodec,
    buf: BytesMut,
}

impl RawTunnel {
    async fn connect(addr: SocketAddr, version: &str, token: Option<&str>) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
        request.headers_mut().insert(
            HeaderName::from_static(VERSION_HEADER),
            HeaderValue::from_str(version).unwrap(),
        );
        if let Some(token) = token {
            request.headers_mut().insert(
                HeaderName::from_static(TOKEN_HEADER),
                HeaderValue::from_str(token).unwrap(),
            );
        }
        let (ws, _) = tokio_tungstenite::client_async(request, socket).await.unwrap();
        Self {
            ws,
            codec: FrameCodec::new(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        let bytes = self.codec.encode_frame(frame).unwrap();
        self.ws.send(Message::Binary(bytes.to_vec())).await.unwrap();
    }

    async fn login(&mut self, webs: Vec<WebConfig>, forwards: Vec<ForwardConfig>) {
        self.send(Frame::login(&LoginMessage { webs, forwards }).unwrap()).await;
    }

    /// Next frame, or `None` once the relay closed the channel
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                return Some(frame);
            }
            let message = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match message {
                Some(Ok(Message::Binary(data))) => self.buf.extend_from_slice(&data),
                Some(Ok(Message::Text(text))) => self.buf.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    async fn expect_frame(&mut self, frame_type: FrameType) -> Frame {
        loop {
            let frame = self.next_frame().await.expect("channel closed");
            if frame.frame_type == frame_type {
                return frame;
            }
            info!("Skipping {:?} frame: {}", frame.frame_type, frame.payload);
        }
    }
}

/// Open a back-connection for a swap request, as a tunnel client does
async fn open_back_connection(relay: SocketAddr, frame: &Frame) -> TcpStream {
    let request: SwapTarget = frame.swap_target().unwrap();
    let mut back = TcpStream::connect(relay).await.unwrap();
    let marker = back_connection_marker(&request.request_id, "127.0.0.1", relay.port());
    back.write_all(marker.as_bytes()).await.unwrap();
    back
}

fn web(sub_domain: &str) -> WebConfig {
    WebConfig {
        sub_domain: sub_domain.to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port: 8080,
        www: vec![],
    }
}

async fn read_response(stream: &mut TcpStream) -> String {
    let mut response = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejects_invalid_token() {
    let relay = start_relay(RelayConfig {
        tokens: vec!["secret".to_string()],
        ..RelayConfig::default()
    })
    .await;

    let mut tunnel = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, Some("wrong")).await;
    let frame = tunnel.next_frame().await.expect("expected a rejection notice");
    assert_eq!(frame.frame_type, FrameType::Log);
    assert_eq!(frame.payload, "token validation failed");
    assert!(tunnel.next_frame().await.is_none());
    assert_eq!(relay.registry.online_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejects_incompatible_version() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut tunnel = RawTunnel::connect(relay.addr, "999.0.0", None).await;
    let frame = tunnel.next_frame().await.expect("expected a rejection notice");
    assert_eq!(frame.frame_type, FrameType::Log);
    assert!(frame.payload.contains("incompatible"), "got {}", frame.payload);
    assert!(tunnel.next_frame().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_accepts_valid_token() {
    let relay = start_relay(RelayConfig {
        tokens: vec!["a".to_string(), "secret".to_string()],
        ..RelayConfig::default()
    })
    .await;

    let mut tunnel = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, Some("secret")).await;
    tunnel.login(vec![web("app")], vec![]).await;
    let frame = tunnel.expect_frame(FrameType::Log).await;
    assert!(frame.payload.starts_with("Web ready: http://app.localhost:"), "got {}", frame.payload);
    assert_eq!(relay.registry.online_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_host_gets_offline_page() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut public = TcpStream::connect(relay.addr).await.unwrap();
    public
        .write_all(b"GET / HTTP/1.1\r\nHost: nobody.localhost\r\n\r\n")
        .await
        .unwrap();

    let response = read_response(&mut public).await;
    assert!(response.starts_with("HTTP/1.1 503"), "got {}", response);
    assert!(response.contains("nobody.localhost is offline"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_web_request_is_swapped_through_back_connection() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut tunnel = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    tunnel.login(vec![web("app")], vec![]).await;
    tunnel.expect_frame(FrameType::Log).await;

    let request = b"GET /hello HTTP/1.1\r\nHost: app.localhost\r\n\r\n";
    let mut public = TcpStream::connect(relay.addr).await.unwrap();
    public.write_all(request).await.unwrap();

    let swap = tunnel.expect_frame(FrameType::SwapRequest).await;
    let target = swap.swap_target().unwrap();
    assert_eq!(target.target.to_string(), "127.0.0.1:8080");

    let mut back = open_back_connection(relay.addr, &swap).await;

    // The relay replays the public request on the back-connection
    let mut forwarded = vec![0u8; request.len()];
    timeout(Duration::from_secs(5), back.read_exact(&mut forwarded))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&forwarded, request);

    back.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
        .await
        .unwrap();
    drop(back);

    let response = read_response(&mut public).await;
    assert_eq!(response, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    assert_eq!(relay.registry.pending().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unanswered_swap_serves_offline_page() {
    let relay = start_relay(RelayConfig {
        correlation_timeout: Duration::from_secs(1),
        ..RelayConfig::default()
    })
    .await;

    let mut tunnel = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    tunnel.login(vec![web("slow")], vec![]).await;
    tunnel.expect_frame(FrameType::Log).await;

    let mut public = TcpStream::connect(relay.addr).await.unwrap();
    public
        .write_all(b"GET / HTTP/1.1\r\nHost: slow.localhost\r\n\r\n")
        .await
        .unwrap();

    // Receive the request but never call back
    tunnel.expect_frame(FrameType::SwapRequest).await;

    let response = read_response(&mut public).await;
    assert!(response.starts_with("HTTP/1.1 503"), "got {}", response);
    assert!(response.contains("slow.localhost is offline"));
    assert_eq!(relay.registry.pending().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_back_connection_is_dropped() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut back = TcpStream::connect(relay.addr).await.unwrap();
    back.write_all(b"PROXY /0123456789abcdef0123456789abcdef HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), back.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(read.is_err() || buf.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forward_connection_is_swapped() {
    let relay = start_relay(forward_config()).await;
    let port = free_port().await;

    let mut tunnel = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    tunnel
        .login(
            vec![],
            vec![ForwardConfig {
                name: Some("db".to_string()),
                local_ip: "127.0.0.1".to_string(),
                local_port: 5432,
                remote_port: port,
            }],
        )
        .await;
    let ready = tunnel.expect_frame(FrameType::Log).await;
    assert!(ready.payload.starts_with("Forward ready"), "got {}", ready.payload);
    assert!(relay.registry.is_port_registered(port));

    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    public.write_all(b"ping").await.unwrap();

    let request = tunnel.expect_frame(FrameType::ForwardRequest).await;
    assert_eq!(
        request.swap_target().unwrap().target.to_string(),
        "127.0.0.1:5432"
    );

    let mut back = open_back_connection(relay.addr, &request).await;
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), back.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    back.write_all(b"pong").await.unwrap();

    timeout(Duration::from_secs(5), public.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_client_cannot_take_forward_port() {
    let relay = start_relay(forward_config()).await;
    let port = free_port().await;
    let forward = ForwardConfig {
        name: None,
        local_ip: "127.0.0.1".to_string(),
        local_port: 22,
        remote_port: port,
    };

    let mut first = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    first.login(vec![], vec![forward.clone()]).await;
    first.expect_frame(FrameType::Log).await;

    let mut second = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    second.login(vec![], vec![forward]).await;
    let notice = second.expect_frame(FrameType::Log).await;
    assert!(notice.payload.contains("already in use"), "got {}", notice.payload);

    // The rejected client leaving does not release the port
    drop(second);
    let registry = relay.registry.clone();
    wait_until(move || registry.online_count() == 1).await;
    assert!(relay.registry.is_port_registered(port));
    assert_eq!(relay.registry.forward_list().count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwarding_disabled() {
    let relay = start_relay(RelayConfig {
        enable_forward: false,
        ..forward_config()
    })
    .await;
    let port = free_port().await;

    let mut tunnel = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    tunnel
        .login(
            vec![],
            vec![ForwardConfig {
                name: None,
                local_ip: "127.0.0.1".to_string(),
                local_port: 22,
                remote_port: port,
            }],
        )
        .await;
    let notice = tunnel.expect_frame(FrameType::Log).await;
    assert!(notice.payload.contains("disabled"), "got {}", notice.payload);
    assert!(!relay.registry.is_port_registered(port));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_cleans_up_session() {
    let relay = start_relay(forward_config()).await;
    let port = free_port().await;

    let mut tunnel = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    tunnel
        .login(
            vec![web("gone")],
            vec![ForwardConfig {
                name: None,
                local_ip: "127.0.0.1".to_string(),
                local_port: 22,
                remote_port: port,
            }],
        )
        .await;
    tunnel.expect_frame(FrameType::Log).await;
    tunnel.expect_frame(FrameType::Log).await;
    assert!(relay.registry.lookup_web("gone.localhost").is_some());

    drop(tunnel);

    let registry = relay.registry.clone();
    wait_until(move || {
        registry.online_count() == 0
            && registry.lookup_web("gone.localhost").is_none()
            && !registry.is_port_registered(port)
    })
    .await;

    // The forward port is closed again
    wait_until(move || std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()).await;

    let mut public = TcpStream::connect(relay.addr).await.unwrap();
    public
        .write_all(b"GET / HTTP/1.1\r\nHost: gone.localhost\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut public).await;
    assert!(response.starts_with("HTTP/1.1 503"), "got {}", response);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_last_login_wins_host() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut first = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    first.login(vec![web("shared")], vec![]).await;
    first.expect_frame(FrameType::Log).await;

    let mut second = RawTunnel::connect(relay.addr, PROTOCOL_VERSION, None).await;
    second.login(vec![web("shared")], vec![]).await;
    second.expect_frame(FrameType::Log).await;

    let owner = relay.registry.lookup_web("shared.localhost").unwrap();
    let sessions = relay.registry.sessions();
    assert_eq!(sessions.len(), 2);

    // The first client leaving must not remove the second client's host
    let first_id = sessions
        .iter()
        .find(|s| s.id() != owner.session.id())
        .unwrap()
        .id();
    drop(first);

    let registry = relay.registry.clone();
    wait_until(move || registry.sessions().iter().all(|s| s.id() != first_id)).await;
    let owner_after = relay.registry.lookup_web("shared.localhost").unwrap();
    assert_eq!(owner_after.session.id(), owner.session.id());
}
