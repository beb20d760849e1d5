//! LogIn processing: register declared webs and forwards

use crate::server::RelayContext;
use backhaul_control::{ForwardMapping, TunnelSession, WebMapping};
use backhaul_proto::{ForwardConfig, LoginMessage, TargetAddr, WebConfig};
use backhaul_server_tcp::{ForwardDispatcher, PortListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn handle_login(
    ctx: &Arc<RelayContext>,
    session: &Arc<TunnelSession>,
    login: LoginMessage,
) {
    info!(
        session_id = %session.id(),
        "Login from {}: {} webs, {} forwards",
        session.remote_addr(),
        login.webs.len(),
        login.forwards.len()
    );

    for web in login.webs {
        register_web(ctx, session, web).await;
    }

    if login.forwards.is_empty() {
        return;
    }
    if !ctx.config.enable_forward {
        session
            .log("Port forwarding is disabled on this server")
            .await;
        return;
    }
    for forward in login.forwards {
        register_forward(ctx, session, forward).await;
    }
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

async fn register_web(ctx: &Arc<RelayContext>, session: &Arc<TunnelSession>, web: WebConfig) {
    if !valid_label(&web.sub_domain) {
        session
            .log(format!("Rejected web with invalid sub-domain {:?}", web.sub_domain))
            .await;
        return;
    }

    let target = TargetAddr::new(web.local_ip, web.local_port);
    let hosts = std::iter::once(ctx.config.web_host(&web.sub_domain))
        .chain(web.www.into_iter().filter(|h| valid_label(h)));

    for host in hosts {
        ctx.registry.register_web(WebMapping {
            host: host.clone(),
            target: target.clone(),
            session: session.clone(),
        });
        info!(session_id = %session.id(), "Web {} -> {}", host, target);
        session
            .log(format!(
                "Web ready: {} => {}",
                ctx.config.web_url(&host.to_ascii_lowercase()),
                target
            ))
            .await;
    }
}

/// Port for a forward that left the choice to the relay
async fn assign_port(ctx: &RelayContext, name: Option<&str>) -> Option<u16> {
    let pool = ctx.port_pool.as_ref()?;
    pool.assign(name, |port| ctx.registry.is_port_registered(port))
        .await
}

async fn register_forward(
    ctx: &Arc<RelayContext>,
    session: &Arc<TunnelSession>,
    forward: ForwardConfig,
) {
    let target = TargetAddr::new(forward.local_ip, forward.local_port);

    let port = match forward.remote_port {
        0 => match assign_port(ctx, forward.name.as_deref()).await {
            Some(port) => port,
            None => {
                session
                    .log(format!("No free port available to forward {}", target))
                    .await;
                return;
            }
        },
        port => port,
    };

    if let Some(existing) = ctx.registry.lookup_forward(port) {
        if existing.session.id() == session.id() && existing.target == target {
            session
                .log(format!("Forward {} => {} already active", port, target))
                .await;
        } else {
            warn!(
                session_id = %session.id(),
                "Port {} requested by {} is already forwarded",
                port,
                session.remote_addr()
            );
            session
                .log(format!("Port {} is already in use by another client", port))
                .await;
        }
        return;
    }

    let bind_addr = SocketAddr::new(ctx.config.forward_bind_ip, port);
    let listener = match PortListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(session_id = %session.id(), "Forward on port {} failed: {}", port, e);
            session
                .log(format!("Port {} could not be opened: {}", port, e))
                .await;
            return;
        }
    };

    let mapping = ForwardMapping {
        name: forward.name.clone(),
        remote_port: port,
        target: target.clone(),
        session: session.clone(),
        listener: listener.handle(),
    };
    if ctx.registry.add_forward(mapping).is_err() {
        // Lost a race for the port; the unspawned listener closes on drop
        session
            .log(format!("Port {} is already in use by another client", port))
            .await;
        return;
    }

    let dispatcher = ForwardDispatcher::new(ctx.registry.clone(), session.clone(), target.clone(), port)
        .with_config(ctx.dispatch_config())
        .with_shutdown(ctx.shutdown.clone());
    listener.spawn(Arc::new(dispatcher));

    info!(session_id = %session.id(), "Forward {} -> {}", port, target);
    session
        .log(format!(
            "Forward ready: {}:{} => {}",
            ctx.config.web_domain, port, target
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_label() {
        assert!(valid_label("app-1"));
        assert!(valid_label("www.example.com"));
        assert!(!valid_label(""));
        assert!(!valid_label("a b"));
        assert!(!valid_label("a/b"));
    }
}
