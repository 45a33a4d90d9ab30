//! Pluggable request/response handler.
//!
//! A handler observes and rewrites traffic passing through the session loop.
//! Each capability is independently optional: the default implementations
//! leave the exchange untouched, so implementors override only what they
//! need.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::Response;

use crate::error::ProxyError;
use crate::session::Session;

/// Outcome of [`ProxyHandler::handle_request`].
pub enum RequestAction {
    /// Forward the request unchanged.
    Forward,
    /// Substitute this request for upstream dispatch.
    ReplaceRequest(http::Request<Bytes>),
    /// Skip upstream entirely: write this response back to the client and
    /// close the connection.
    ShortCircuit(Response<Bytes>),
}

#[async_trait]
pub trait ProxyHandler: Send + Sync {
    /// Called after request preparation, before upstream dispatch.
    async fn handle_request(&self, _session: &mut Session) -> Result<RequestAction> {
        Ok(RequestAction::Forward)
    }

    /// Called after upstream dispatch, before the response is written. A
    /// returned response replaces `session.response`.
    async fn handle_response(&self, _session: &mut Session) -> Result<Option<Response<Bytes>>> {
        Ok(None)
    }

    /// Called for requests addressed to the proxy's own API host. Return
    /// `true` after writing a response to take the request over completely.
    async fn handle_api_request(&self, _session: &mut Session) -> Result<bool> {
        Ok(false)
    }

    /// Receives every error event the session loop produces. `session` is
    /// absent when the error happened outside a request (e.g. a parse
    /// failure) or after the stream changed hands.
    async fn handle_error(&self, _session: Option<&Session>, _error: &ProxyError) {}
}

/// Routes an error through the handler, if any. Without a handler the error
/// is discarded here; the connection is still torn down by the caller.
pub(crate) async fn funnel_error(
    handler: Option<&dyn ProxyHandler>,
    session: Option<&Session>,
    error: &ProxyError,
) {
    if let Some(handler) = handler {
        handler.handle_error(session, error).await;
    }
}
