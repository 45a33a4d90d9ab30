//! Root CA management and per-host leaf certificate minting.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    SanType, PKCS_ECDSA_P256_SHA256,
};
use rustls::ServerConfig;
use tokio::sync::Mutex;
use tracing::debug;

use super::tls::server_config;
use super::CertificateFactory;

const DEFAULT_CACHE_SIZE: usize = 1024;
const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const LEAF_VALIDITY_DAYS: i64 = 90;
const CA_VALIDITY_DAYS: i64 = 10 * 365;

struct CachedConfig {
    config: Arc<ServerConfig>,
    created_at: Instant,
}

impl CachedConfig {
    fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Certificate authority minting leaf certificates for intercepted hosts.
pub struct CertificateAuthority {
    ca: Certificate,
    ca_der: Vec<u8>,
    cache: Mutex<LruCache<String, CachedConfig>>,
    config_ttl: Duration,
}

impl CertificateAuthority {
    /// Generates a fresh self-signed root CA. Mostly useful for tests and
    /// ephemeral deployments; clients must fetch and install `/cert.crt`
    /// before interception works.
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "middleman");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(CA_VALIDITY_DAYS);

        let ca = Certificate::from_params(params).context("failed to generate root CA")?;
        // ECDSA signatures are randomized; serialize once and keep the DER
        // so every caller sees the same certificate bytes.
        let ca_der = ca.serialize_der().context("failed to serialize root CA")?;
        Ok(Self::from_parts(ca, ca_der))
    }

    /// Loads an existing root CA from PEM-encoded certificate and private
    /// key files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("failed to read CA certificate {}", cert_path.display()))?;
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("failed to read CA private key {}", key_path.display()))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Loads an existing root CA from PEM-encoded certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem).context("invalid CA private key")?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .context("invalid CA certificate")?;
        let ca = Certificate::from_params(params).context("failed to assemble root CA")?;

        // Keep the on-disk certificate bytes rather than re-signing, so the
        // DER served to clients matches what they may already trust.
        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .context("no CERTIFICATE block in CA file")?
            .context("malformed CERTIFICATE block in CA file")?
            .to_vec();
        Ok(Self::from_parts(ca, ca_der))
    }

    fn from_parts(ca: Certificate, ca_der: Vec<u8>) -> Self {
        let capacity =
            NonZeroUsize::new(DEFAULT_CACHE_SIZE).expect("default cache size is nonzero");
        Self {
            ca,
            ca_der,
            cache: Mutex::new(LruCache::new(capacity)),
            config_ttl: DEFAULT_CONFIG_TTL,
        }
    }

    /// Overrides how long minted configs are reused before re-minting.
    pub fn with_config_ttl(mut self, ttl: Duration) -> Self {
        self.config_ttl = ttl;
        self
    }

    fn mint(&self, host: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.distinguished_name.push(DnType::CommonName, host);
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.to_string())],
        };
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(serial_number().into());

        let key_pair =
            KeyPair::generate(&PKCS_ECDSA_P256_SHA256).context("failed to generate leaf key")?;
        params.key_pair = Some(key_pair);

        let leaf =
            Certificate::from_params(params).context("failed to assemble leaf certificate")?;
        let leaf_der = leaf
            .serialize_der_with_signer(&self.ca)
            .context("failed to sign leaf certificate")?;
        let key_der = leaf.serialize_private_key_der();
        Ok((leaf_der, key_der))
    }
}

#[async_trait]
impl CertificateFactory for CertificateAuthority {
    async fn tls_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(host) {
                if cached.is_expired(self.config_ttl) {
                    cache.pop(host);
                } else {
                    debug!(host, "leaf config cache hit");
                    return Ok(Arc::clone(&cached.config));
                }
            }
        }

        debug!(host, "minting leaf certificate");
        let (leaf_der, key_der) = self.mint(host)?;
        let config = server_config(vec![leaf_der, self.ca_der.clone()], key_der)
            .map_err(anyhow::Error::from)?;

        let mut cache = self.cache.lock().await;
        cache.put(host.to_string(), CachedConfig::new(Arc::clone(&config)));
        Ok(config)
    }

    fn ca_certificate_der(&self) -> Vec<u8> {
        self.ca_der.clone()
    }
}

/// Unique serial from crypto RNG plus a timestamp.
fn serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}
