//! Public HTTP entry: route by Host to the owning client

use crate::error::RelayError;
use crate::server::RelayContext;
use backhaul_connection::{swap, PrefixedStream};
use backhaul_control::{CorrelationError, RequestKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Response served when no client is connected for a host
pub fn offline_response(host: &str) -> String {
    let host = escape_html(host);
    let body = format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{host} is offline</title></head>\
         <body><h1>{host} is offline</h1>\
         <p>No tunnel client is currently serving this host. Try again once it reconnects.</p>\
         </body></html>"
    );
    format!(
        "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn error_response(status: &str, message: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        message.len(),
        message
    )
}

async fn respond(stream: &mut PrefixedStream<TcpStream>, response: String) -> Result<(), RelayError> {
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Resolves once the public client has closed its side of the connection
async fn client_gone(socket: &TcpStream) {
    let mut probe = [0u8; 1];
    match socket.peek(&mut probe).await {
        Ok(0) | Err(_) => {}
        // The client is sending; it is still there
        Ok(_) => std::future::pending::<()>().await,
    }
}

pub(crate) async fn serve_public(
    ctx: Arc<RelayContext>,
    mut stream: PrefixedStream<TcpStream>,
    peer_addr: SocketAddr,
    host: Option<String>,
) -> Result<(), RelayError> {
    let Some(host) = host else {
        return respond(&mut stream, error_response("400 Bad Request", "Missing Host header")).await;
    };

    let Some(mapping) = ctx.registry.lookup_web(&host) else {
        debug!("No tunnel for host {} (from {})", host, peer_addr);
        return respond(&mut stream, offline_response(&host)).await;
    };

    let request = ctx.registry.request_stream(
        &mapping.session,
        RequestKind::Web,
        mapping.target.clone(),
        ctx.config.correlation_timeout,
        Some(&ctx.shutdown),
    );

    let result = tokio::select! {
        result = request => result,
        _ = client_gone(stream.get_ref()) => {
            debug!("Public client {} left before the back-connection arrived", peer_addr);
            return Ok(());
        }
    };

    let back = match result {
        Ok(back) => back,
        Err(CorrelationError::SessionClosed) => {
            return respond(&mut stream, offline_response(&host)).await;
        }
        Err(CorrelationError::Timeout(timeout)) => {
            // An unanswered request means the client is effectively offline
            warn!("Back-connection for {} timed out after {:?}", host, timeout);
            return respond(&mut stream, offline_response(&host)).await;
        }
        Err(e) => {
            warn!("Back-connection for {} failed: {}", host, e);
            return respond(
                &mut stream,
                error_response("502 Bad Gateway", "Tunnel unavailable"),
            )
            .await;
        }
    };

    debug!("Swapping {} for {} with {}", peer_addr, host, mapping.target);
    swap(stream, back, ctx.swap_config(), &ctx.shutdown).await?;
    Ok(())
}
