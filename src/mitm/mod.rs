//! TLS interception certificate machinery.
//!
//! The session loop only knows the [`CertificateFactory`] interface: given a
//! hostname, produce a rustls server config backed by a leaf certificate the
//! client will accept, and expose the root CA so clients can install it. The
//! concrete [`CertificateAuthority`] mints ECDSA P-256 leaves signed by a
//! root CA, caching the resulting configs per host.

pub mod authority;
pub mod tls;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rustls::ServerConfig;

pub use authority::CertificateAuthority;
pub use tls::TlsConfigError;

/// Mints per-host TLS server configurations from a root CA.
///
/// Presence of a factory on the proxy config is what enables TLS
/// interception; without one every CONNECT is forwarded opaquely.
#[async_trait]
pub trait CertificateFactory: Send + Sync {
    /// Returns a rustls server config whose certificate is issued for
    /// `host` (hostname or IP literal, no port).
    async fn tls_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>>;

    /// Raw DER bytes of the root CA certificate, as served by the
    /// `/cert.crt` control endpoint.
    fn ca_certificate_der(&self) -> Vec<u8>;
}
