//! Outbound connections to the relay (control channel and back-connections)

use crate::config::ServerEndpoint;
use crate::error::ClientError;
use backhaul_connection::BoxedStream;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens TCP (or TLS for `wss://`) connections to the relay
#[derive(Clone)]
pub struct Connector {
    endpoint: ServerEndpoint,
    tls: Option<tokio_rustls::TlsConnector>,
}

impl Connector {
    pub fn new(endpoint: ServerEndpoint, insecure: bool) -> Result<Self, ClientError> {
        let tls = if endpoint.is_tls() {
            Some(build_tls_connector(insecure))
        } else {
            None
        };
        Ok(Self { endpoint, tls })
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Connect to the relay, completing TLS when the endpoint uses it
    pub async fn connect(&self) -> Result<BoxedStream, ClientError> {
        let address = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let socket = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port))
            .await
            .map_err(|source| ClientError::ConnectionFailed {
                address: address.clone(),
                source,
            })?;
        let _ = socket.set_nodelay(true);
        debug!("Connected to {}", address);

        let Some(tls) = &self.tls else {
            return Ok(Box::new(socket));
        };

        let server_name = rustls::pki_types::ServerName::try_from(self.endpoint.host.clone())
            .map_err(|e| ClientError::Tls(format!("Invalid server name {}: {}", self.endpoint.host, e)))?;
        let stream = tls
            .connect(server_name, socket)
            .await
            .map_err(|e| ClientError::Tls(format!("TLS handshake with {} failed: {}", address, e)))?;
        Ok(Box::new(stream))
    }
}

fn build_tls_connector(insecure: bool) -> tokio_rustls::TlsConnector {
    ensure_crypto_provider();

    let client_crypto = if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    tokio_rustls::TlsConnector::from(Arc::new(client_crypto))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
