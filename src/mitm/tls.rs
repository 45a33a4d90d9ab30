//! rustls server config assembly for intercepted connections.

use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::version::{TLS12, TLS13};
use rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("invalid certificate or key: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Builds the client-facing server config from a DER certificate chain
/// (leaf first) and a PKCS#8 private key. TLS 1.2 and 1.3 only; the client
/// side of this proxy speaks HTTP/1.x, so only `http/1.1` is offered via
/// ALPN.
pub(crate) fn server_config(
    chain_der: Vec<Vec<u8>>,
    key_der: Vec<u8>,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let chain: Vec<CertificateDer<'static>> =
        chain_der.into_iter().map(CertificateDer::from).collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&TLS12, &TLS13])
        .map_err(|err| TlsConfigError::Config(err.to_string()))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|err| TlsConfigError::InvalidCertificate(err.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
