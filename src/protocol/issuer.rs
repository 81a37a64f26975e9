//! # Identity Issuer
//!
//! A small certificate authority for the agent endpoint. Masters get a
//! certificate whose `O=` attribute binds their organization; the
//! coordinator gets one naming its server DNS name.

use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};

use super::errors::{ProtocolError, ProtocolResult};
use crate::master::Organization;

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca.key";

/// A certificate and its private key, PEM encoded.
#[derive(Debug, Clone)]
pub struct IssuedIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl IssuedIdentity {
    /// Write `<stem>.pem` and `<stem>.key` into `dir`.
    pub fn write(&self, dir: &Path, stem: &str) -> ProtocolResult<()> {
        fs::create_dir_all(dir).map_err(io_error)?;
        fs::write(dir.join(format!("{stem}.pem")), &self.cert_pem).map_err(io_error)?;
        fs::write(dir.join(format!("{stem}.key")), &self.key_pem).map_err(io_error)?;
        Ok(())
    }
}

/// Issues identities chained to one CA.
pub struct IdentityIssuer {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
}

impl std::fmt::Debug for IdentityIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityIssuer").finish_non_exhaustive()
    }
}

impl IdentityIssuer {
    /// Create a fresh CA.
    pub fn generate(common_name: &str) -> ProtocolResult<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(issuance)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate().map_err(issuance)?;
        let ca_cert = params.self_signed(&ca_key).map_err(issuance)?;
        let ca_cert_pem = ca_cert.pem();
        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
        })
    }

    /// Load an existing CA from PEM.
    ///
    /// The certificate is re-signed in memory for use as an issuer; subject
    /// and key are unchanged, so issued certificates chain to the original.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> ProtocolResult<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| ProtocolError::PrivateKey(format!("failed to parse CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| ProtocolError::Certificate(format!("failed to parse CA certificate: {e}")))?;
        let ca_cert = params.self_signed(&ca_key).map_err(issuance)?;
        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Load `ca.pem` and `ca.key` from `dir`.
    pub fn load(dir: &Path) -> ProtocolResult<Self> {
        let cert = fs::read_to_string(dir.join(CA_CERT_FILE)).map_err(io_error)?;
        let key = fs::read_to_string(dir.join(CA_KEY_FILE)).map_err(io_error)?;
        Self::from_pem(&cert, &key)
    }

    /// Write `ca.pem` and `ca.key` into `dir`.
    pub fn save(&self, dir: &Path) -> ProtocolResult<()> {
        fs::create_dir_all(dir).map_err(io_error)?;
        fs::write(dir.join(CA_CERT_FILE), &self.ca_cert_pem).map_err(io_error)?;
        fs::write(dir.join(CA_KEY_FILE), self.ca_key.serialize_pem()).map_err(io_error)?;
        Ok(())
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Identity for a master agent, bound to `organization`.
    pub fn issue_master(&self, organization: &Organization) -> ProtocolResult<IssuedIdentity> {
        self.issue(organization.as_str(), Some(organization.as_str()), &[])
    }

    /// Identity for the coordinator's agent endpoint.
    pub fn issue_coordinator(
        &self,
        server_name: &str,
        organization: &Organization,
    ) -> ProtocolResult<IssuedIdentity> {
        self.issue(server_name, Some(organization.as_str()), &[server_name])
    }

    /// Issue a certificate usable for both ends of a mutual TLS session.
    pub fn issue(
        &self,
        common_name: &str,
        organization: Option<&str>,
        dns_names: &[&str],
    ) -> ProtocolResult<IssuedIdentity> {
        let names: Vec<String> = dns_names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(names).map_err(issuance)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        if let Some(org) = organization {
            params.distinguished_name.push(DnType::OrganizationName, org);
        }
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key = KeyPair::generate().map_err(issuance)?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(issuance)?;
        Ok(IssuedIdentity {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

fn issuance(err: rcgen::Error) -> ProtocolError {
    ProtocolError::Issuance(err.to_string())
}

fn io_error(err: std::io::Error) -> ProtocolError {
    ProtocolError::Io(err.to_string())
}
