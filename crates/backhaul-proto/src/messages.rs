//! JSON payloads carried inside control frames

use serde::{Deserialize, Serialize};

/// Login declaration sent by the client on every (re)connect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginMessage {
    #[serde(default)]
    pub webs: Vec<WebConfig>,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

/// A public host routed to a local HTTP service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebConfig {
    /// Registered as `{sub_domain}.{relay web domain}`
    pub sub_domain: String,
    pub local_ip: String,
    pub local_port: u16,
    /// Additional fully-qualified host names served by the same mapping
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub www: Vec<String>,
}

/// A public TCP port routed to a local TCP service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Stable name used to remember port assignments across reconnects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub local_ip: String,
    pub local_port: u16,
    /// 0 asks the relay to assign a port
    #[serde(default)]
    pub remote_port: u16,
}
