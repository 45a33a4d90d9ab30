//! TCP accept loop.
//!
//! One spawned task per accepted connection owns that connection's session
//! loop; there is no other concurrency inside a connection. The listener is
//! the layer that logs: the session core itself reports errors only through
//! the handler funnel.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::auth::AuthCache;
use crate::config::ProxyConfig;
use crate::inbound::InboundSender;
use crate::session::handle_conn;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Intercepting proxy listener.
pub struct ProxyListener {
    addr: SocketAddr,
    config: Arc<ProxyConfig>,
    auth_cache: Option<Arc<AuthCache>>,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicU64>,
}

impl ProxyListener {
    pub fn new(addr: SocketAddr, config: Arc<ProxyConfig>) -> Self {
        Self {
            addr,
            config,
            auth_cache: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enables proxy authentication against the given cache.
    pub fn with_auth_cache(mut self, cache: Arc<AuthCache>) -> Self {
        self.auth_cache = Some(cache);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current number of in-flight connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Requests a graceful stop; the accept loop exits within one poll
    /// interval. In-flight connections run to completion.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Accepts connections until shutdown, handing non-intercepted tunnels
    /// to `inbound`.
    pub async fn serve(&self, inbound: InboundSender) -> io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "intercepting proxy listening");

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("proxy listener shutting down");
                break;
            }

            let accepted = match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(result) => result,
                // Timeout: loop around to check the shutdown flag.
                Err(_) => continue,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let config = Arc::clone(&self.config);
                    let inbound = inbound.clone();
                    let cache = self.auth_cache.clone();
                    let counter = Arc::clone(&self.active_connections);
                    counter.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        handle_conn(stream, peer, config, inbound, cache).await;
                        counter.fetch_sub(1, Ordering::Relaxed);
                        debug!(%peer, "connection closed");
                    });
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        Ok(())
    }
}
