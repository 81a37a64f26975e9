//! # TLS Configuration
//!
//! Mutual TLS for the agent endpoint. Both sides present a certificate
//! chained to the same CA; the acceptor refuses clients without one.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::errors::{ProtocolError, ProtocolResult};

/// Client and server TLS configurations built from one identity.
#[derive(Clone)]
pub struct TlsConfig {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

/// Builder for [`TlsConfig`] over PEM material.
#[derive(Default)]
pub struct TlsConfigBuilder {
    ca_cert_pem: Option<Vec<u8>>,
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Vec<u8>>,
}

impl TlsConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// CA certificate(s) trusted for peer verification.
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    /// Our certificate chain.
    pub fn cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.cert_pem = Some(pem.into());
        self
    }

    /// Our private key.
    pub fn key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.key_pem = Some(pem.into());
        self
    }

    pub fn build(self) -> ProtocolResult<TlsConfig> {
        let ca_pem = self
            .ca_cert_pem
            .ok_or_else(|| ProtocolError::TlsConfig("CA certificate required".into()))?;
        let cert_pem = self
            .cert_pem
            .ok_or_else(|| ProtocolError::TlsConfig("certificate required".into()))?;
        let key_pem = self
            .key_pem
            .ok_or_else(|| ProtocolError::TlsConfig("private key required".into()))?;

        let ca_certs = parse_certificates(&ca_pem)?;
        if ca_certs.is_empty() {
            return Err(ProtocolError::Certificate("no CA certificates found".into()));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| ProtocolError::Certificate(format!("failed to add CA certificate: {e}")))?;
        }
        let roots = Arc::new(roots);

        let certs = parse_certificates(&cert_pem)?;
        if certs.is_empty() {
            return Err(ProtocolError::Certificate("no certificates found".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(&key_pem)
            .map_err(|e| ProtocolError::PrivateKey(format!("failed to parse private key: {e}")))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let client_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProtocolError::TlsConfig(format!("client config error: {e}")))?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .map_err(|e| ProtocolError::TlsConfig(format!("client config error: {e}")))?;

        let verifier =
            rustls::server::WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
                .build()
                .map_err(|e| ProtocolError::TlsConfig(format!("client verifier error: {e}")))?;

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProtocolError::TlsConfig(format!("server config error: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ProtocolError::TlsConfig(format!("server config error: {e}")))?;

        Ok(TlsConfig {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }
}

impl TlsConfig {
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }

    /// Load CA, certificate and key from PEM files.
    pub fn from_files(ca_cert: &Path, cert: &Path, key: &Path) -> ProtocolResult<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| ProtocolError::TlsConfig(format!("failed to read {}: {e}", path.display())))
        };
        Self::builder()
            .ca_cert_pem(read(ca_cert)?)
            .cert_pem(read(cert)?)
            .key_pem(read(key)?)
            .build()
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

/// Parse the DNS name the acceptor's certificate must carry.
pub fn server_name(name: &str) -> ProtocolResult<ServerName<'static>> {
    ServerName::try_from(name.to_owned())
        .map_err(|e| ProtocolError::Handshake(format!("invalid server name {name}: {e}")))
}

fn parse_certificates(pem: &[u8]) -> ProtocolResult<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProtocolError::Certificate(format!("failed to parse certificates: {e}")))
}
