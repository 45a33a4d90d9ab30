//! Inbound queue for non-intercepted tunnels.
//!
//! CONNECT tunnels the session loop does not terminate (no certificate
//! factory, non-MITM port, or a first byte that is not a TLS handshake) are
//! handed off here as opaque byte streams, buffer intact, for downstream
//! routing. Once a [`TunnelRequest`] is sent, the queue consumer owns the
//! stream, including closing it.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use http::Request;
use tokio::sync::mpsc;

use crate::stream::BoxedIo;

/// Sender half of the inbound queue, supplied by the caller of
/// [`handle_conn`](crate::session::handle_conn).
pub type InboundSender = mpsc::Sender<TunnelRequest>;

/// An opaque tunnel handed to downstream routing.
pub struct TunnelRequest {
    /// CONNECT target authority (`host:port`).
    pub target: String,
    /// The pinned client source address.
    pub source: SocketAddr,
    /// The original CONNECT request.
    pub request: Request<Bytes>,
    /// The client stream, positioned after the 200 reply. Any bytes the
    /// client already sent are still readable in order.
    pub stream: BoxedIo,
}

impl fmt::Debug for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRequest")
            .field("target", &self.target)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
