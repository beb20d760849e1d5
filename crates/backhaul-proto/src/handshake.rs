//! Tunnel handshake validation
//!
//! The client opens the control channel with a WebSocket upgrade carrying
//! its protocol version and, optionally, an access token.

use thiserror::Error;

/// Header carrying the client's protocol version
pub const VERSION_HEADER: &str = "backhaul-version";

/// Header carrying the client's access token
pub const TOKEN_HEADER: &str = "backhaul-token";

/// Version spoken by this build
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reasons a tunnel handshake is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeRejection {
    #[error("missing version header")]
    MissingVersion,

    #[error("client version {client} incompatible with server {server}")]
    IncompatibleVersion { client: String, server: String },

    #[error("token validation failed")]
    InvalidToken,
}

/// Major component of a dotted version string
fn major(version: &str) -> Option<&str> {
    let major = version.trim().trim_start_matches('v').split('.').next()?;
    (!major.is_empty()).then_some(major)
}

/// Check the handshake headers of a new tunnel.
///
/// Versions are compatible when their major components match. When
/// `accepted_tokens` is empty the relay is open and any token (or none)
/// is accepted.
pub fn validate_handshake(
    client_version: Option<&str>,
    token: Option<&str>,
    accepted_tokens: &[String],
) -> Result<(), HandshakeRejection> {
    let client_version = client_version.ok_or(HandshakeRejection::MissingVersion)?;

    if major(client_version).is_none() || major(client_version) != major(PROTOCOL_VERSION) {
        return Err(HandshakeRejection::IncompatibleVersion {
            client: client_version.to_string(),
            server: PROTOCOL_VERSION.to_string(),
        });
    }

    if accepted_tokens.is_empty() {
        return Ok(());
    }

    match token {
        Some(token) if accepted_tokens.iter().any(|t| t == token) => Ok(()),
        _ => Err(HandshakeRejection::InvalidToken),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_relay_accepts_any_token() {
        assert!(validate_handshake(Some(PROTOCOL_VERSION), None, &[]).is_ok());
        assert!(validate_handshake(Some(PROTOCOL_VERSION), Some("x"), &[]).is_ok());
    }

    #[test]
    fn test_token_required() {
        let tokens = vec!["secret".to_string()];
        assert!(validate_handshake(Some(PROTOCOL_VERSION), Some("secret"), &tokens).is_ok());
        assert_eq!(
            validate_handshake(Some(PROTOCOL_VERSION), Some("wrong"), &tokens),
            Err(HandshakeRejection::InvalidToken)
        );
        assert_eq!(
            validate_handshake(Some(PROTOCOL_VERSION), None, &tokens),
            Err(HandshakeRejection::InvalidToken)
        );
    }

    #[test]
    fn test_major_version_mismatch() {
        let result = validate_handshake(Some("999.0.0"), None, &[]);
        assert!(matches!(
            result,
            Err(HandshakeRejection::IncompatibleVersion { .. })
        ));
        assert_eq!(
            validate_handshake(None, None, &[]),
            Err(HandshakeRejection::MissingVersion)
        );
    }

    #[test]
    fn test_minor_version_difference_is_compatible() {
        let major = PROTOCOL_VERSION.split('.').next().unwrap();
        let other = format!("{}.99.7", major);
        assert!(validate_handshake(Some(&other), None, &[]).is_ok());
    }
}
