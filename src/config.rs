//! Proxy configuration.
//!
//! [`ProxyConfig`] carries the collaborators the session loop needs.
//! [`ListenerConfig`] is the deployment-facing layer: environment variables
//! in, validated `ProxyConfig` out.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::handler::ProxyHandler;
use crate::mitm::{CertificateAuthority, CertificateFactory};
use crate::upstream::{DirectDispatcher, Dispatcher};

/// Options recognized by the session loop.
pub struct ProxyConfig {
    /// Presence enables TLS interception; absence forwards every CONNECT
    /// opaquely.
    pub cert_config: Option<Arc<dyn CertificateFactory>>,

    /// Hostname identifying requests addressed to the proxy itself.
    pub api_host: String,

    /// Optional traffic handler plugin.
    pub handler: Option<Arc<dyn ProxyHandler>>,

    /// Opens per-client upstream dispatchers.
    pub dispatcher: Arc<dyn Dispatcher>,
}

impl ProxyConfig {
    /// Config with direct upstream dispatch, no interception, no handler.
    pub fn new(api_host: impl Into<String>) -> Self {
        Self {
            cert_config: None,
            api_host: api_host.into(),
            handler: None,
            dispatcher: Arc::new(DirectDispatcher),
        }
    }

    pub fn with_cert_config(mut self, factory: Arc<dyn CertificateFactory>) -> Self {
        self.cert_config = Some(factory);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ProxyHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }
}

/// Deployment configuration sourced from the environment.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Listen address, `MIDDLEMAN_BIND` (default `127.0.0.1:7080`).
    pub bind: SocketAddr,

    /// API hostname, `MIDDLEMAN_API_HOST` (default `middleman.internal`).
    pub api_host: String,

    /// Root CA certificate and key paths, `MIDDLEMAN_CA_CERT` /
    /// `MIDDLEMAN_CA_KEY`. Both present enables interception.
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,

    /// Whether to require proxy authentication, `MIDDLEMAN_AUTH` (default
    /// off).
    pub auth_enabled: bool,
}

impl ListenerConfig {
    pub fn from_env() -> Result<Self> {
        let bind = env::var("MIDDLEMAN_BIND")
            .unwrap_or_else(|_| "127.0.0.1:7080".to_string())
            .parse()
            .context("invalid MIDDLEMAN_BIND")?;

        let api_host =
            env::var("MIDDLEMAN_API_HOST").unwrap_or_else(|_| "middleman.internal".to_string());
        if api_host.is_empty() {
            anyhow::bail!("MIDDLEMAN_API_HOST cannot be empty");
        }

        let ca_cert_path = env::var("MIDDLEMAN_CA_CERT").ok().map(PathBuf::from);
        let ca_key_path = env::var("MIDDLEMAN_CA_KEY").ok().map(PathBuf::from);
        if ca_cert_path.is_some() != ca_key_path.is_some() {
            anyhow::bail!("MIDDLEMAN_CA_CERT and MIDDLEMAN_CA_KEY must be set together");
        }

        let auth_enabled = env::var("MIDDLEMAN_AUTH")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            bind,
            api_host,
            ca_cert_path,
            ca_key_path,
            auth_enabled,
        })
    }

    /// Builds the session-loop config, loading the root CA when configured.
    pub fn into_proxy_config(self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::new(self.api_host);
        if let (Some(cert_path), Some(key_path)) = (self.ca_cert_path, self.ca_key_path) {
            let authority = CertificateAuthority::from_pem_files(&cert_path, &key_path)
                .context("failed to load root CA")?;
            config = config.with_cert_config(Arc::new(authority));
        }
        Ok(config)
    }
}
