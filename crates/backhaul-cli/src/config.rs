//! Config file loading and `--web` / `--forward` flag parsing
//!
//! Both the relay and the client read YAML files. Flags given on the
//! command line are applied on top of whatever the file declared.

use anyhow::{bail, Context, Result};
use backhaul_proto::{ForwardConfig, WebConfig};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Load a YAML config file
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let yaml =
        fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

    let config = serde_yaml::from_str(&yaml)
        .context(format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

/// Split `host:port`, or a bare port meaning `127.0.0.1:port`
fn parse_local_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
        None => ("127.0.0.1", target),
    };
    if host.is_empty() {
        bail!("missing host in {:?}", target);
    }
    let port = port
        .parse::<u16>()
        .context(format!("invalid port in {:?}", target))?;
    if port == 0 {
        bail!("local port must not be 0 in {:?}", target);
    }
    Ok((host.to_string(), port))
}

/// Parse `--web sub_domain=[host:]port`
pub fn parse_web(value: &str) -> Result<WebConfig> {
    let Some((sub_domain, target)) = value.split_once('=') else {
        bail!("expected sub_domain=[host:]port, got {:?}", value);
    };
    if sub_domain.is_empty() {
        bail!("missing sub-domain in {:?}", value);
    }
    let (local_ip, local_port) = parse_local_target(target)?;

    Ok(WebConfig {
        sub_domain: sub_domain.to_string(),
        local_ip,
        local_port,
        www: Vec::new(),
    })
}

/// Parse `--forward [name@]remote_port=[host:]port`; a remote port of 0
/// lets the relay pick one
pub fn parse_forward(value: &str) -> Result<ForwardConfig> {
    let Some((remote, target)) = value.split_once('=') else {
        bail!("expected [name@]remote_port=[host:]port, got {:?}", value);
    };
    let (name, remote_port) = match remote.split_once('@') {
        Some((name, port)) if !name.is_empty() => (Some(name.to_string()), port),
        Some(_) => bail!("empty forward name in {:?}", value),
        None => (None, remote),
    };
    let remote_port = remote_port
        .parse::<u16>()
        .context(format!("invalid remote port in {:?}", value))?;
    let (local_ip, local_port) = parse_local_target(target)?;

    Ok(ForwardConfig {
        name,
        local_ip,
        local_port,
        remote_port,
    })
}
