//! Root certificate authority and per-domain leaf issuance.
//!
//! The root is loaded once, either the bundled `files/interceptor-ca.*` pair
//! or a user supplied one. Leaves are issued on first use for a domain and
//! kept for the lifetime of the authority; there is no eviction.

use dashmap::DashMap;
use rand::Rng;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber,
    PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const EMBEDDED_CA_CERT: &str = include_str!("../../files/interceptor-ca.crt");
const EMBEDDED_CA_KEY: &str = include_str!("../../files/interceptor-ca.key");

const LEAF_VALIDITY_YEARS: i32 = 10;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    #[error("Failed to load root certificate: {0}")]
    Load(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Issued material for one domain.
pub struct LeafCertificate {
    pub domain: String,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_der: Vec<u8>,
    pub key_pem: String,
    pub serial: u64,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// Leaf plus root chain, ALPN restricted to `http/1.1`.
    pub server_config: Arc<ServerConfig>,
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("domain", &self.domain)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

pub struct CertificateAuthority {
    /// Root as re-encoded by rcgen, used only as the issuer when signing
    issuer: Certificate,
    issuer_key: KeyPair,
    /// Root exactly as loaded, served in every chain
    root_der: CertificateDer<'static>,
    root_pem: String,
    leaves: DashMap<String, Arc<LeafCertificate>>,
}

impl CertificateAuthority {
    /// Authority backed by the root bundled with the crate.
    pub fn embedded() -> Result<Self, CertificateError> {
        Self::from_pem(EMBEDDED_CA_CERT, EMBEDDED_CA_KEY)
    }

    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CertificateError> {
        let cert_pem = fs::read_to_string(cert_path.as_ref())?;
        let key_pem = fs::read_to_string(key_path.as_ref())?;

        tracing::info!(cert_path = ?cert_path.as_ref(), "Loaded root certificate from disk");

        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertificateError> {
        let issuer_key =
            KeyPair::from_pem(key_pem).map_err(|e| CertificateError::Load(e.to_string()))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CertificateError::Load(e.to_string()))?;
        let issuer = params
            .self_signed(&issuer_key)
            .map_err(|e| CertificateError::Load(e.to_string()))?;

        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertificateError::Load("No certificate found in PEM".to_string()))?
            .map_err(|e| CertificateError::Load(e.to_string()))?;

        Ok(Self {
            issuer,
            issuer_key,
            root_der,
            root_pem: cert_pem.to_string(),
            leaves: DashMap::new(),
        })
    }

    /// Leaf certificate for `domain`, issued on first request and cached.
    ///
    /// Repeated calls return the same material. Issuance is CPU bound; async
    /// callers should run it on a blocking thread.
    pub fn certificate_for(&self, domain: &str) -> Result<Arc<LeafCertificate>, CertificateError> {
        if let Some(leaf) = self.leaves.get(domain) {
            tracing::debug!(domain = domain, "Using cached leaf certificate");
            return Ok(leaf.clone());
        }

        let leaf = Arc::new(self.issue(domain)?);

        // Concurrent issuers for the same domain race here; the first insert wins
        let leaf = self
            .leaves
            .entry(domain.to_string())
            .or_insert(leaf)
            .clone();

        tracing::info!(
            domain = domain,
            serial = leaf.serial,
            "Issued leaf certificate"
        );

        Ok(leaf)
    }

    fn issue(&self, domain: &str) -> Result<LeafCertificate, CertificateError> {
        let generation = |e: rcgen::Error| CertificateError::Generation(e.to_string());

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(generation)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;

        params.subject_alt_names = vec![match domain.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(domain.to_string().try_into().map_err(|e| {
                CertificateError::Generation(format!("Invalid domain name {domain:?}: {e:?}"))
            })?),
        }];

        let serial = rand::thread_rng().gen_range(1..=i64::MAX as u64);
        params.serial_number = Some(SerialNumber::from(serial));

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now
            .replace_year(now.year() + LEAF_VALIDITY_YEARS)
            .unwrap_or_else(|_| now + Duration::days(3652));

        let (not_before, not_after) = (params.not_before, params.not_after);

        let key_pair = generate_key_pair().map_err(generation)?;
        let cert = params
            .signed_by(&key_pair, &self.issuer, &self.issuer_key)
            .map_err(generation)?;

        let cert_der = cert.der().clone();
        let key_der = key_pair.serialize_der();

        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der.clone()));
        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone(), self.root_der.clone()], private_key)
            .map_err(|e| CertificateError::InvalidCert(e.to_string()))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafCertificate {
            domain: domain.to_string(),
            cert_pem: cert.pem(),
            cert_der,
            key_pem: key_pair.serialize_pem(),
            key_der,
            serial,
            not_before,
            not_after,
            server_config: Arc::new(server_config),
        })
    }

    /// PEM text of the root, for installing into client trust stores.
    pub fn ca_cert_pem(&self) -> &str {
        &self.root_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    pub fn cached_domains(&self) -> usize {
        self.leaves.len()
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_domains", &self.leaves.len())
            .finish()
    }
}

// RSA-2048 where the crypto backend can generate it, P-256 otherwise
fn generate_key_pair() -> Result<KeyPair, rcgen::Error> {
    KeyPair::generate_for(&PKCS_RSA_SHA256).or_else(|e| {
        tracing::debug!(error = %e, "RSA key generation unavailable, using ECDSA P-256");
        KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
    })
}
