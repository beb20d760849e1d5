//! Client configuration

use crate::error::ClientError;
use backhaul_proto::{ForwardConfig, WebConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    Ws,
    Wss,
}

impl ServerProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            ServerProtocol::Ws => "ws",
            ServerProtocol::Wss => "wss",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            ServerProtocol::Ws => 80,
            ServerProtocol::Wss => 443,
        }
    }
}

/// Relay tunnel endpoint, written as `ws://host:port` or `wss://host:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerEndpoint {
    pub protocol: ServerProtocol,
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn url(&self) -> String {
        format!("{}://{}:{}/", self.protocol.scheme(), self.host, self.port)
    }

    pub fn is_tls(&self) -> bool {
        self.protocol == ServerProtocol::Wss
    }
}

impl FromStr for ServerEndpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ClientError::InvalidServerUrl(format!("{}: {}", s, e)))?;

        let protocol = match url.scheme() {
            "ws" | "http" => ServerProtocol::Ws,
            "wss" | "https" => ServerProtocol::Wss,
            other => {
                return Err(ClientError::InvalidServerUrl(format!(
                    "unsupported scheme {:?}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidServerUrl(format!("{}: missing host", s)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or(protocol.default_port());

        Ok(Self {
            protocol,
            host,
            port,
        })
    }
}

impl TryFrom<String> for ServerEndpoint {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerEndpoint> for String {
    fn from(endpoint: ServerEndpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: ServerEndpoint,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub webs: Vec<WebConfig>,

    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,

    /// Wait between reconnect attempts
    #[serde(default = "default_reconnect_delay", with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Idle read timeout for swapped connections
    #[serde(default = "default_idle_timeout", with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Accept any server certificate (INSECURE)
    #[serde(default)]
    pub insecure: bool,
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
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

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    server: Option<String>,
    token: Option<String>,
    webs: Vec<WebConfig>,
    forwards: Vec<ForwardConfig>,
    reconnect_delay: Option<Duration>,
    idle_timeout: Option<Duration>,
    insecure: bool,
}

impl ClientConfigBuilder {
    pub fn server(mut self, url: impl Into<String>) -> Self {
        self.server = Some(url.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn web(mut self, web: WebConfig) -> Self {
        self.webs.push(web);
        self
    }

    pub fn forward(mut self, forward: ForwardConfig) -> Self {
        self.forwards.push(forward);
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn build(self) -> Result<ClientConfig, String> {
        let server = self
            .server
            .ok_or_else(|| "server URL is required".to_string())?
            .parse::<ServerEndpoint>()
            .map_err(|e| e.to_string())?;

        Ok(ClientConfig {
            server,
            token: self.token,
            webs: self.webs,
            forwards: self.forwards,
            reconnect_delay: self.reconnect_delay.unwrap_or_else(default_reconnect_delay),
            idle_timeout: self.idle_timeout.unwrap_or_else(default_idle_timeout),
            insecure: self.insecure,
        })
    }
}
