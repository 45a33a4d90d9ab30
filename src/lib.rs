//! Middleman - Intercepting HTTP/HTTPS Proxy Core
//!
//! Middleman is the session core of an intercepting proxy: clients configure
//! it as their HTTP proxy, and it handles plain HTTP directly, tunnels
//! opaque CONNECT traffic, and (when a certificate authority is configured)
//! transparently terminates TLS on intercepted tunnels to inspect and
//! rewrite the inner HTTP exchange before forwarding it upstream.
//!
//! ## Features
//!
//! - **HTTP/1.0 & HTTP/1.1**: absolute-form proxy requests and origin-form
//!   requests after interception, with keep-alive across both
//! - **TLS interception**: dynamically minted per-host leaf certificates
//!   signed by a root CA, with a one-byte protocol sniff so non-TLS tunnels
//!   pass through untouched
//! - **Pluggable handler**: observe or rewrite requests, responses, API
//!   traffic, and error events
//! - **Proxy authentication**: per-connection trust latch over an externally
//!   maintained credential cache
//! - **Control endpoints**: root CA download at `/cert.crt` on the
//!   configured API host
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use middleman::{CertificateAuthority, ProxyConfig, ProxyListener};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let authority = CertificateAuthority::generate("middleman root ca")?;
//!     let config = Arc::new(
//!         ProxyConfig::new("middleman.internal").with_cert_config(Arc::new(authority)),
//!     );
//!
//!     // Tunnels the proxy does not intercept arrive here for routing.
//!     let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel(64);
//!     tokio::spawn(async move {
//!         while let Some(tunnel) = inbound_rx.recv().await {
//!             let _ = tunnel; // hand to downstream routing
//!         }
//!     });
//!
//!     let listener = ProxyListener::new("127.0.0.1:7080".parse()?, config);
//!     listener.serve(inbound_tx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `session` - the per-connection state loop (the core)
//! - `stream` - buffered connection adapter and composite reader
//! - `http1` - HTTP/1.x wire parsing and serialization
//! - `auth` - credential cache and authentication gate
//! - `handler` - handler plugin trait and error funnel
//! - `upstream` - per-client upstream dispatch
//! - `inbound` - queue handing non-intercepted tunnels downstream
//! - `mitm` - certificate authority and TLS server config assembly
//! - `api` - the proxy's own control endpoints
//! - `server` - TCP accept loop
//! - `config` - proxy options and environment configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod http1;
pub mod inbound;
pub mod mitm;
pub mod server;
pub mod session;
pub mod stream;
pub mod upstream;

/// Authentication
pub use auth::AuthCache;

/// Configuration
pub use config::{ListenerConfig, ProxyConfig};

/// Error taxonomy
pub use error::ProxyError;

/// Handler plugin
pub use handler::{ProxyHandler, RequestAction};

/// Inbound queue
pub use inbound::{InboundSender, TunnelRequest};

/// Certificate machinery
pub use mitm::{CertificateAuthority, CertificateFactory};

/// Accept loop
pub use server::ProxyListener;

/// Session core
pub use session::{handle_conn, Session};

/// Buffered connection adapter
pub use stream::{BufferedStream, SessionIo};

/// Upstream dispatch
pub use upstream::{DirectDispatcher, Dispatcher, Upstream, UpstreamError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
