//! Relay configuration

use backhaul_control::PortPoolConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address of the shared tunnel/HTTP endpoint
    pub bind_addr: SocketAddr,

    /// Web hosts are registered as `{sub_domain}.{web_domain}`
    pub web_domain: String,

    /// Port advertised to clients in web URLs (defaults to the bind port)
    pub public_http_port: Option<u16>,

    /// Accepted client tokens; empty means any client may connect
    pub tokens: Vec<String>,

    /// Whether clients may open forward ports
    pub enable_forward: bool,

    /// Interface forward listeners bind to
    pub forward_bind_ip: IpAddr,

    /// How long to wait for a client's back-connection
    #[serde(with = "duration_secs")]
    pub correlation_timeout: Duration,

    /// Idle read timeout for swapped connections
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Optional cap on concurrently pending back-connections per client
    pub max_pending_per_session: Option<usize>,

    /// Range from which forward ports are assigned
    pub port_pool: PortPoolConfig,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1270),
            web_domain: "localhost".to_string(),
            public_http_port: None,
            tokens: Vec::new(),
            enable_forward: true,
            forward_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            correlation_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            max_pending_per_session: None,
            port_pool: PortPoolConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Public URL of a registered host
    pub fn web_url(&self, host: &str) -> String {
        match self.public_http_port.unwrap_or(self.bind_addr.port()) {
            80 => format!("http://{}", host),
            port => format!("http://{}:{}", host, port),
        }
    }

    /// Full host name for a declared sub-domain
    pub fn web_host(&self, sub_domain: &str) -> String {
        format!("{}.{}", sub_domain.trim_end_matches('.'), self.web_domain)
            .to_ascii_lowercase()
    }
}
