//! Handlers for frames received from the relay

use crate::connector::Connector;
use crate::error::ClientError;
use backhaul_connection::{swap, SwapConfig, SwapStats};
use backhaul_proto::{back_connection_marker, Frame, SwapTarget};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reacts to one kind of relay frame
pub trait FrameHandler: Send + Sync {
    fn handle(&self, frame: Frame) -> Result<(), ClientError>;
}

/// Answers SwapRequest and ForwardRequest frames with a back-connection
pub struct SwapHandler {
    connector: Connector,
    swap: SwapConfig,
    shutdown: CancellationToken,
}

impl SwapHandler {
    pub fn new(connector: Connector, swap: SwapConfig, shutdown: CancellationToken) -> Self {
        Self {
            connector,
            swap,
            shutdown,
        }
    }
}

impl FrameHandler for SwapHandler {
    fn handle(&self, frame: Frame) -> Result<(), ClientError> {
        let request = frame.swap_target()?;
        debug!(request_id = %request.request_id, "Swap requested for {}", request.target);

        let connector = self.connector.clone();
        let config = self.swap;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            match serve_swap(&connector, request, config, &shutdown).await {
                Ok(stats) => debug!(
                    request_id = %request_id,
                    "Swap finished ({} bytes out, {} bytes in)",
                    stats.a_to_b,
                    stats.b_to_a
                ),
                Err(e) => warn!(request_id = %request_id, "Swap failed: {}", e),
            }
        });
        Ok(())
    }
}

/// Open a back-connection for `request` and splice it to the local target
pub async fn serve_swap(
    connector: &Connector,
    request: SwapTarget,
    config: SwapConfig,
    shutdown: &CancellationToken,
) -> Result<SwapStats, ClientError> {
    let endpoint = connector.endpoint();
    let mut back = connector.connect().await?;
    let marker = back_connection_marker(&request.request_id, &endpoint.host, endpoint.port);
    back.write_all(marker.as_bytes()).await?;
    back.flush().await?;

    let local = TcpStream::connect((request.target.host.as_str(), request.target.port))
        .await
        .map_err(|source| ClientError::TargetUnreachable {
            address: request.target.to_string(),
            source,
        })?;
    let _ = local.set_nodelay(true);

    Ok(swap(back, local, config, shutdown).await?)
}

/// Prints relay notices
pub struct LogHandler;

impl FrameHandler for LogHandler {
    fn handle(&self, frame: Frame) -> Result<(), ClientError> {
        info!("[server] {}", frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::{RequestId, TargetAddr};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_serve_swap_sends_marker_and_splices() {
        // Fake relay accepting the back-connection
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();

        // Local service echoing one message
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = local.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let endpoint = format!("ws://127.0.0.1:{}", relay_port).parse().unwrap();
        let connector = Connector::new(endpoint, false).unwrap();
        let request_id = RequestId::generate();
        let request = SwapTarget {
            request_id: request_id.clone(),
            target: TargetAddr::new("127.0.0.1", local_port),
        };

        let shutdown = CancellationToken::new();
        let swap_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { serve_swap(&connector, request, SwapConfig::default(), &shutdown).await }
        });

        let (socket, _) = relay.accept().await.unwrap();
        let mut reader = BufReader::new(socket);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, format!("PROXY /{} HTTP/1.1\r\n", request_id));
        loop {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            if line == "\r\n" {
                break;
            }
        }

        let mut socket = reader.into_inner();
        socket.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        socket.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        drop(socket);

        let stats = swap_task.await.unwrap().unwrap();
        assert_eq!(stats.b_to_a, 5);
    }

    #[tokio::test]
    async fn test_serve_swap_unreachable_target() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = relay.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let endpoint = format!("ws://127.0.0.1:{}", relay_port).parse().unwrap();
        let connector = Connector::new(endpoint, false).unwrap();
        let request = SwapTarget {
            request_id: RequestId::generate(),
            target: TargetAddr::new("127.0.0.1", closed_port),
        };

        let result = serve_swap(&connector, request, SwapConfig::default(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(ClientError::TargetUnreachable { .. })));
    }

    #[test]
    fn test_swap_handler_rejects_bad_payload() {
        let endpoint = "ws://127.0.0.1:1".parse().unwrap();
        let handler = SwapHandler::new(
            Connector::new(endpoint, false).unwrap(),
            SwapConfig::default(),
            CancellationToken::new(),
        );
        let frame = Frame::new(backhaul_proto::FrameType::SwapRequest, "no-separator");
        assert!(matches!(handler.handle(frame), Err(ClientError::Frame(_))));
    }
}
