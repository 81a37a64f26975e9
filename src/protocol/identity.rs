//! Peer identity extracted from a verified certificate

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::errors::SecurityError;

/// Who is on the other end of a TLS session.
///
/// Only built from certificates rustls has already chain-verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    pub common_name: Option<String>,
    /// Organization (`O=`) attribute, when the certificate binds one.
    pub organization: Option<String>,
    /// `SHA256:<base64>` of the DER certificate.
    pub fingerprint: String,
}

impl PeerIdentity {
    pub fn from_der(der: &[u8]) -> Result<Self, SecurityError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| SecurityError::InvalidCertificate(e.to_string()))?;
        let subject = cert.subject();

        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);
        let organization = subject
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);

        Ok(Self {
            common_name,
            organization,
            fingerprint: fingerprint(der),
        })
    }

    /// Leaf identity of a verified TLS peer.
    pub fn from_peer_certificates(
        certs: Option<&[rustls::pki_types::CertificateDer<'_>]>,
    ) -> Result<Self, SecurityError> {
        let leaf = certs
            .and_then(|c| c.first())
            .ok_or(SecurityError::MissingCertificate)?;
        Self::from_der(leaf.as_ref())
    }
}

/// `SHA256:<base64>` fingerprint of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::Organization;
    use crate::protocol::IdentityIssuer;
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::CertificateDer;

    #[test]
    fn test_reads_bound_organization() {
        let issuer = IdentityIssuer::generate("Test CA").unwrap();
        let issued = issuer
            .issue_master(&Organization::new("org3").unwrap())
            .unwrap();
        let der = CertificateDer::from_pem_slice(issued.cert_pem.as_bytes()).unwrap();

        let identity = PeerIdentity::from_der(der.as_ref()).unwrap();
        assert_eq!(identity.organization.as_deref(), Some("org3"));
        assert_eq!(identity.common_name.as_deref(), Some("org3"));
        assert!(identity.fingerprint.starts_with("SHA256:"));
    }

    #[test]
    fn test_missing_certificate() {
        assert_eq!(
            PeerIdentity::from_peer_certificates(None).unwrap_err(),
            SecurityError::MissingCertificate
        );
    }

    #[test]
    fn test_garbage_is_invalid() {
        let err = PeerIdentity::from_der(b"garbage").unwrap_err();
        assert!(matches!(err, SecurityError::InvalidCertificate(_)));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
    }
}
