//! Error taxonomy for the session loop.
//!
//! Every variant except the authentication miss (which is a 407 response,
//! not an error) is surfaced through [`ProxyHandler::handle_error`] when a
//! handler is installed; the session core itself never logs.
//!
//! [`ProxyHandler::handle_error`]: crate::handler::ProxyHandler::handle_error

use std::io;

use thiserror::Error;

use crate::http1::ReadError;
use crate::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request parse or peek failure on the client stream.
    #[error("client read failed: {0}")]
    ClientRead(#[from] ReadError),

    /// Any write toward the client failed.
    #[error("client write failed: {0}")]
    ClientWrite(#[source] io::Error),

    /// TLS server handshake on an intercepted tunnel failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),

    /// The upstream dispatcher returned an error.
    #[error("upstream: {0}")]
    Upstream(#[source] UpstreamError),

    /// The upstream presented a certificate this proxy cannot accept.
    /// Same policy as [`ProxyError::Upstream`]; the offending host is not
    /// blocked.
    #[error("upstream certificate not supported: {0}")]
    UnsupportedCert(String),

    /// The prepared request lacks a scheme or host.
    #[error("request has no scheme or host after preparation")]
    InvalidUrl,

    /// A handler callback failed; fatal for the current connection.
    #[error("handler failed: {0}")]
    Handler(String),
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::CertUnsupported(message) => Self::UnsupportedCert(message),
            other => Self::Upstream(other),
        }
    }
}
