//! CA material and the default leaf signer
//!
//! The proxy terminates victim TLS with leaf certificates forged on the fly.
//! Signing is an injected capability ([`SignFn`]); this module supplies the
//! rcgen-backed default and the load-or-create handling for the CA key pair
//! the operator installs as the MITM root.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    SanType,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SignError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("invalid hostname {0:?}")]
    InvalidHostname(String),
}

/// A forged leaf identity ready for rustls.
pub struct TlsIdentity {
    pub host: String,
    pub port: u16,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Leaf-signing capability: given the CA and a host/port, produce a signed
/// leaf identity.
pub type SignFn = Arc<dyn Fn(&CaAuthority, &str, u16) -> Result<TlsIdentity, SignError> + Send + Sync>;

/// The CA key pair used to sign forged leaves.
pub struct CaAuthority {
    cert: Certificate,
}

impl CaAuthority {
    /// Load the CA from PEM files, generating and persisting a fresh one
    /// when either file is missing.
    pub fn load_or_create(cert_path: &Path, key_path: &Path) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(cert_path)
                .with_context(|| format!("reading CA certificate {}", cert_path.display()))?;
            let key_pem = fs::read_to_string(key_path)
                .with_context(|| format!("reading CA key {}", key_path.display()))?;

            let key_pair = KeyPair::from_pem(&key_pem).context("parsing CA private key")?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
                .context("parsing CA certificate")?;
            let cert = Certificate::from_params(params).context("rebuilding CA certificate")?;

            debug!(path = %cert_path.display(), "Loaded existing MITM CA");
            return Ok(Self { cert });
        }

        let ca = Self::generate()?;
        fs::write(cert_path, ca.cert.serialize_pem().context("serializing CA certificate")?)
            .with_context(|| format!("writing {}", cert_path.display()))?;
        fs::write(key_path, ca.cert.serialize_private_key_pem())
            .with_context(|| format!("writing {}", key_path.display()))?;

        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Generated new MITM CA"
        );
        Ok(ca)
    }

    /// Generate an in-memory CA, used directly by tests and by
    /// `load_or_create` before persisting.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "netsnare CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "netsnare");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);

        let cert = Certificate::from_params(params).context("generating CA certificate")?;
        Ok(Self { cert })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }
}

/// The default leaf signer: CommonName + SAN for the host, bounded validity,
/// random serial, ECDSA P-256, signed by the CA.
pub fn default_signer() -> SignFn {
    Arc::new(|ca, host, port| sign_leaf(ca, host, port))
}

fn sign_leaf(ca: &CaAuthority, host: &str, port: u16) -> Result<TlsIdentity, SignError> {
    if host.is_empty() {
        return Err(SignError::InvalidHostname(host.to_string()));
    }

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, host.to_string());
    params.subject_alt_names = vec![match host.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(host.to_string()),
    }];
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
    params.serial_number = Some(random_serial().into());

    let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| SignError::Generation(e.to_string()))?;
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.key_pair = Some(key_pair);

    let leaf = Certificate::from_params(params).map_err(|e| SignError::Generation(e.to_string()))?;
    let cert_der = leaf
        .serialize_der_with_signer(ca.certificate())
        .map_err(|e| SignError::Generation(e.to_string()))?;
    let key_der = leaf.serialize_private_key_der();

    Ok(TlsIdentity {
        host: host.to_string(),
        port,
        cert_der,
        key_der,
    })
}

/// Unique serial from crypto RNG + timestamp.
fn random_serial() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}
