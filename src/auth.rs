//! Proxy authentication gate.
//!
//! Credentials are opaque fingerprints: the raw `Proxy-Authorization` header
//! value is looked up in an externally maintained cache mapping fingerprint
//! to validity. The gate itself neither decodes nor verifies credentials;
//! whatever fills the cache (a config reload, a control plane, a test) owns
//! that policy. Passing no cache to the session loop disables authentication
//! entirely.

use std::num::NonZeroUsize;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use lru::LruCache;
use tokio::sync::Mutex;

const DEFAULT_CAPACITY: usize = 1024;

const PROXY_AUTHENTICATE_VALUE: &str = "Basic realm=\"middleman\"";

/// Cache of credential fingerprint to validity.
pub struct AuthCache {
    entries: Mutex<LruCache<String, bool>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).expect("nonzero default"));
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records a credential fingerprint as valid or invalid.
    pub async fn put(&self, credential: impl Into<String>, valid: bool) {
        self.entries.lock().await.put(credential.into(), valid);
    }

    /// Forgets a credential fingerprint.
    pub async fn forget(&self, credential: &str) {
        self.entries.lock().await.pop(credential);
    }

    /// Looks up a credential fingerprint; `None` means unknown.
    pub async fn check(&self, credential: &str) -> Option<bool> {
        self.entries.lock().await.get(credential).copied()
    }
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Consults the cache with the request's `Proxy-Authorization` header.
/// Returns `None` to accept (the caller latches trust), or a ready-to-write
/// `407 Proxy Authentication Required` response.
pub(crate) async fn authenticate(
    request: &Request<Bytes>,
    cache: &AuthCache,
) -> Option<Response<Bytes>> {
    if let Some(credential) = request
        .headers()
        .get(header::PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if cache.check(credential).await == Some(true) {
            return None;
        }
    }
    Some(proxy_auth_required())
}

fn proxy_auth_required() -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .header(header::PROXY_AUTHENTICATE, PROXY_AUTHENTICATE_VALUE)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from_static(b"Proxy authentication required\n"))
        .unwrap()
}
