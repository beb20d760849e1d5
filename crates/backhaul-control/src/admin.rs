//! Read-only snapshots of registry state for operators

use crate::registry::SessionRegistry;
use serde::Serialize;
use std::collections::HashMap;

const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A counted list of rows
#[derive(Debug, Clone, Serialize)]
pub struct Listing<T> {
    pub count: usize,
    pub rows: Vec<T>,
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(rows: Vec<T>) -> Self {
        Self {
            count: rows.len(),
            rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebInfo {
    pub host: String,
    pub local_ip: String,
    pub local_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardInfo {
    pub name: Option<String>,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Connections currently being dispatched through this port
    pub active_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub session_id: String,
    pub remote_addr: String,
    pub start_time: String,
    pub webs: Vec<WebInfo>,
    pub forwards: Vec<ForwardInfo>,
}

impl SessionRegistry {
    /// Every registered host
    pub fn web_list(&self) -> Listing<WebInfo> {
        let mut rows: Vec<WebInfo> = self
            .webs()
            .iter()
            .map(|e| WebInfo {
                host: e.key().clone(),
                local_ip: e.target.host.clone(),
                local_port: e.target.port,
            })
            .collect();
        rows.sort_by(|a, b| a.host.cmp(&b.host));
        rows.into()
    }

    /// Every registered forward port
    pub fn forward_list(&self) -> Listing<ForwardInfo> {
        let mut rows: Vec<ForwardInfo> = self
            .forwards()
            .iter()
            .map(|e| ForwardInfo {
                name: e.name.clone(),
                local_ip: e.target.host.clone(),
                local_port: e.target.port,
                remote_port: e.remote_port,
                active_connections: e.listener.in_flight(),
            })
            .collect();
        rows.sort_by_key(|f| f.remote_port);
        rows.into()
    }

    /// Connected clients with what each of them serves
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut webs: HashMap<uuid::Uuid, Vec<WebInfo>> = HashMap::new();
        for entry in self.webs().iter() {
            webs.entry(entry.session.id()).or_default().push(WebInfo {
                host: entry.key().clone(),
                local_ip: entry.target.host.clone(),
                local_port: entry.target.port,
            });
        }

        let mut forwards: HashMap<uuid::Uuid, Vec<ForwardInfo>> = HashMap::new();
        for entry in self.forwards().iter() {
            forwards
                .entry(entry.session.id())
                .or_default()
                .push(ForwardInfo {
                    name: entry.name.clone(),
                    local_ip: entry.target.host.clone(),
                    local_port: entry.target.port,
                    remote_port: entry.remote_port,
                    active_connections: entry.listener.in_flight(),
                });
        }

        let mut clients: Vec<ClientInfo> = self
            .sessions()
            .into_iter()
            .map(|session| {
                let id = session.id();
                ClientInfo {
                    session_id: id.to_string(),
                    remote_addr: session.remote_addr().ip().to_string(),
                    start_time: session.started_at().format(START_TIME_FORMAT).to_string(),
                    webs: webs.remove(&id).unwrap_or_default(),
                    forwards: forwards.remove(&id).unwrap_or_default(),
                }
            })
            .collect();
        clients.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        clients
    }

    /// Ids of requests still waiting for a back-connection
    pub fn pending_snapshot(&self) -> Listing<String> {
        self.pending()
            .ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .into()
    }
}
