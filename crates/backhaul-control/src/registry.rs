//! Session registry
//!
//! Process-wide view of connected sessions and what they serve: web hosts
//! (looked up by the public HTTP entry point) and forward ports (each with
//! a running listener). Lookups, registrations and removals are safe under
//! concurrent use from many connection tasks.

use crate::listener::ListenerHandle;
use crate::pending_requests::PendingRequests;
use crate::session::TunnelSession;
use backhaul_connection::BoxedStream;
use backhaul_proto::{RequestId, TargetAddr};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Notifications about explicit forward registration changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEvent {
    Added { name: Option<String>, port: u16 },
    Removed { name: Option<String>, port: u16 },
}

/// A public host routed to a local HTTP target through a session
#[derive(Debug, Clone)]
pub struct WebMapping {
    pub host: String,
    pub target: TargetAddr,
    pub session: Arc<TunnelSession>,
}

/// A public port routed to a local TCP target through a session
#[derive(Debug, Clone)]
pub struct ForwardMapping {
    pub name: Option<String>,
    pub remote_port: u16,
    pub target: TargetAddr,
    pub session: Arc<TunnelSession>,
    pub listener: ListenerHandle,
}

/// Normalize a Host header value into a registry key
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.strip_prefix('[') {
        // IPv6 literal, keep the brackets' content
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => host.split(':').next().unwrap_or(host),
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Registry of live sessions and their routes
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<TunnelSession>>,
    webs: DashMap<String, WebMapping>,
    forwards: DashMap<u16, ForwardMapping>,
    pending: PendingRequests,
    online: AtomicUsize,
    events: broadcast::Sender<ForwardEvent>,
    max_pending_per_session: Option<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: DashMap::new(),
            webs: DashMap::new(),
            forwards: DashMap::new(),
            pending: PendingRequests::new(),
            online: AtomicUsize::new(0),
            events,
            max_pending_per_session: None,
        }
    }

    /// Cap the number of concurrently pending back-connections per session
    pub fn with_max_pending_per_session(mut self, limit: Option<usize>) -> Self {
        self.max_pending_per_session = limit;
        self
    }

    pub fn max_pending_per_session(&self) -> Option<usize> {
        self.max_pending_per_session
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Subscribe to forward add/remove notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ForwardEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Record a newly connected session
    pub fn login(&self, session: Arc<TunnelSession>) {
        let id = session.id();
        let remote = session.remote_addr();
        if self.sessions.insert(id, session).is_none() {
            let online = self.online.fetch_add(1, Ordering::SeqCst) + 1;
            info!(session_id = %id, "Client {} connected, {} online", remote, online);
        }
    }

    /// Remove a session and everything it registered.
    ///
    /// Forward listeners are stopped before this returns. Port assignments
    /// are left in place so a reconnecting client gets its port back, hence
    /// no [`ForwardEvent::Removed`] is raised here. Idempotent.
    pub async fn logout(&self, session: &Arc<TunnelSession>) {
        let id = session.id();

        if self.sessions.remove(&id).is_some() {
            let online = self.online.fetch_sub(1, Ordering::SeqCst) - 1;
            info!(
                session_id = %id,
                "Client {} disconnected, {} online",
                session.remote_addr(),
                online
            );
        }

        for port in session.take_forward_ports() {
            let removed = self
                .forwards
                .remove_if(&port, |_, mapping| mapping.session.id() == id);
            if let Some((_, mapping)) = removed {
                mapping.listener.stop().await;
                info!(session_id = %id, "Stopped forward listener on port {}", port);
            }
        }

        for host in session.take_hosts() {
            if self
                .webs
                .remove_if(&host, |_, mapping| mapping.session.id() == id)
                .is_some()
            {
                debug!(session_id = %id, "Unregistered host {}", host);
            }
        }

        session.close();
    }

    pub fn online_count(&self) -> usize {
        self.online.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Register (or take over) a public host.
    ///
    /// The last registration wins; the replaced mapping is returned.
    pub fn register_web(&self, mapping: WebMapping) -> Option<WebMapping> {
        let host = normalize_host(&mapping.host);
        mapping.session.record_host(&host);
        let mapping = WebMapping { host: host.clone(), ..mapping };

        let previous = self.webs.insert(host.clone(), mapping);
        if let Some(previous) = &previous {
            warn!(
                "Host {} re-registered, replacing route to {}",
                host,
                previous.session.remote_addr()
            );
        }
        previous
    }

    pub fn lookup_web(&self, host: &str) -> Option<WebMapping> {
        self.webs
            .get(&normalize_host(host))
            .map(|e| e.value().clone())
    }

    /// Register a forward port.
    ///
    /// Fails (returning the mapping back) if the port is already
    /// registered; the caller owns stopping the rejected listener.
    pub fn add_forward(&self, mapping: ForwardMapping) -> Result<(), ForwardMapping> {
        let port = mapping.remote_port;
        let name = mapping.name.clone();

        match self.forwards.entry(port) {
            Entry::Occupied(_) => return Err(mapping),
            Entry::Vacant(slot) => {
                mapping.session.record_forward(port);
                slot.insert(mapping);
            }
        }

        info!("Forward registered on port {}", port);
        self.emit(ForwardEvent::Added { name, port });
        Ok(())
    }

    /// Explicitly remove a forward port, stopping its listener
    pub async fn remove_forward(&self, port: u16) -> bool {
        let Some((_, mapping)) = self.forwards.remove(&port) else {
            return false;
        };

        mapping.session.forget_forward(port);
        mapping.listener.stop().await;
        info!("Forward on port {} removed", port);
        self.emit(ForwardEvent::Removed {
            name: mapping.name,
            port,
        });
        true
    }

    pub fn lookup_forward(&self, port: u16) -> Option<ForwardMapping> {
        self.forwards.get(&port).map(|e| e.value().clone())
    }

    pub fn is_port_registered(&self, port: u16) -> bool {
        self.forwards.contains_key(&port)
    }

    /// Every public port currently held by a forward
    pub fn used_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.forwards.iter().map(|e| *e.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// Deliver a back-connection to the request waiting for it
    pub fn resolve(&self, id: &RequestId, stream: BoxedStream) -> bool {
        self.pending.resolve(id, stream)
    }

    pub(crate) fn webs(&self) -> &DashMap<String, WebMapping> {
        &self.webs
    }

    pub(crate) fn forwards(&self) -> &DashMap<u16, ForwardMapping> {
        &self.forwards
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
