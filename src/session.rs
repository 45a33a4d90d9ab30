//! The per-connection session state machine.
//!
//! [`handle_conn`] owns one client connection for its lifetime and
//! multiplexes four paths over it: plain HTTP forwarding, CONNECT
//! passthrough, TLS interception, and the proxy's own API endpoints. It runs
//! two nested loops: the outer loop restarts only when a CONNECT tunnel has
//! been upgraded to a TLS-terminated stream (parsing then resumes on the
//! inner stream); the inner loop parses successive keep-alive requests on
//! the current stream.
//!
//! The loop never logs; every error is routed through the handler's error
//! hook and the connection torn down as the taxonomy prescribes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::api;
use crate::auth::{self, AuthCache};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::handler::{funnel_error, RequestAction};
use crate::http1::{self, ReadError};
use crate::inbound::{InboundSender, TunnelRequest};
use crate::stream::{BoxedIo, BufferedStream};
use crate::upstream::{Upstream, UpstreamError};

/// Read deadline armed before every client read. Deliberately longer than
/// the advertised keep-alive timeout so a clean client closes first.
const READ_DEADLINE: Duration = Duration::from_secs(30);

/// TLS record content type for a handshake (RFC 5246 §6.2.1).
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;

/// Header carrying the original client address when the connection was
/// relayed to us. Honored on the first request of a connection only, and
/// stripped from every forwarded request.
const SOURCE_ADDRESS_HEADER: HeaderName =
    HeaderName::from_static("origin-request-source-address");

/// The client-side stream as the session loop sees it.
pub type ClientConn = BufferedStream<BoxedIo>;

/// Per-request session state handed to handler hooks.
pub struct Session {
    pub(crate) conn: ClientConn,
    /// The most recently parsed inbound request.
    pub request: Request<Bytes>,
    /// The response to be written, once produced.
    pub response: Option<Response<Bytes>>,
    /// First client-observed source address, pinned for the connection.
    pub source: SocketAddr,
    intercepted: bool,
}

impl Session {
    fn new(conn: ClientConn, request: Request<Bytes>, source: SocketAddr, intercepted: bool) -> Self {
        Self {
            conn,
            request,
            response: None,
            source,
            intercepted,
        }
    }

    /// Whether the current stream is TLS-terminated by the proxy.
    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    /// Direct access to the client stream, for handlers that write their own
    /// responses (API takeover).
    pub fn stream_mut(&mut self) -> &mut ClientConn {
        &mut self.conn
    }

    /// Builds a plain response with the given status and body.
    pub fn new_response(&self, status: StatusCode, body: impl Into<Bytes>) -> Response<Bytes> {
        Response::builder()
            .status(status)
            .body(body.into())
            .unwrap()
    }

    /// Builds the 502-style response delivered to the client when dispatch
    /// fails.
    pub fn error_response(&self, error: &ProxyError) -> Response<Bytes> {
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Bytes::from(format!("middleman: {error}\n")))
            .unwrap()
    }

    pub(crate) fn conn_and_response(&mut self) -> (&mut ClientConn, Option<&Response<Bytes>>) {
        (&mut self.conn, self.response.as_ref())
    }

    fn into_conn(self) -> ClientConn {
        self.conn
    }
}

/// Outcome of CONNECT handling.
enum ConnectOutcome {
    /// TLS interception succeeded; resume the outer loop on this stream.
    Intercepted(BoxedIo),
    /// The stream was handed to the inbound queue, which now owns it.
    Handover,
    /// The connection is done; the error, if any, was already funneled.
    Closed,
}

/// Runs the session loop for one accepted client connection.
///
/// `peer` is the raw TCP remote address, used as the source identity unless
/// the first request carries a valid `Origin-Request-Source-Address` header.
/// `cache` of `None` disables proxy authentication. Errors never propagate
/// to the caller; they are funneled through the handler and the connection
/// closed.
pub async fn handle_conn<S>(
    stream: S,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    inbound: InboundSender,
    cache: Option<Arc<AuthCache>>,
) where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let mut upstream: Option<Arc<dyn Upstream>> = None;
    run_session(
        Box::new(stream),
        peer,
        &config,
        &inbound,
        cache.as_deref(),
        &mut upstream,
    )
    .await;
    if let Some(upstream) = upstream {
        upstream.release();
    }
}

async fn run_session(
    mut stream: BoxedIo,
    peer: SocketAddr,
    config: &ProxyConfig,
    inbound: &InboundSender,
    cache: Option<&AuthCache>,
    upstream: &mut Option<Arc<dyn Upstream>>,
) {
    let handler = config.handler.as_deref();
    // Trust latch: set once credentials validate, reset only when a new
    // outer connection is accepted. TLS interception restarts keep it.
    let mut trusted = cache.is_none();
    let mut source: Option<SocketAddr> = None;
    let mut intercepted = false;

    'restart: loop {
        let mut conn = BufferedStream::new(stream);

        loop {
            let mut request = match timeout(READ_DEADLINE, http1::read_request(&mut conn)).await {
                Ok(Ok(request)) => request,
                Ok(Err(err)) => {
                    funnel_error(handler, None, &ProxyError::ClientRead(err)).await;
                    return;
                }
                Err(_) => {
                    let err = ReadError::Io(io::ErrorKind::TimedOut.into());
                    funnel_error(handler, None, &ProxyError::ClientRead(err)).await;
                    return;
                }
            };

            // Source pinning: the header is stripped from every request but
            // only consulted on the first one of the connection.
            let relayed = request.headers_mut().remove(&SOURCE_ADDRESS_HEADER);
            let source = *source.get_or_insert_with(|| {
                relayed
                    .as_ref()
                    .and_then(parse_source_address)
                    .unwrap_or(peer)
            });

            let mut session = Session::new(conn, request, source, intercepted);

            if !trusted {
                if let Some(cache) = cache {
                    if let Some(response) = auth::authenticate(&session.request, cache).await {
                        session.response = Some(response);
                        match write_with_handler(&mut session, config, true).await {
                            Ok(()) => {
                                conn = session.into_conn();
                                continue;
                            }
                            Err(err) => {
                                funnel_error(handler, Some(&session), &err).await;
                                return;
                            }
                        }
                    }
                }
                trusted = true;
            }

            if session.request.method() == Method::CONNECT {
                match connect_tunnel(session, config, inbound).await {
                    ConnectOutcome::Intercepted(inner) => {
                        stream = inner;
                        intercepted = true;
                        continue 'restart;
                    }
                    ConnectOutcome::Handover | ConnectOutcome::Closed => return,
                }
            }

            if http1::request_hostname(&session.request).as_deref()
                == Some(config.api_host.as_str())
            {
                if let Err(err) = api::handle_api_request(&mut session, config).await {
                    funnel_error(handler, Some(&session), &err).await;
                }
                return;
            }

            prepare_request(&mut session);

            if let Some(plugin) = &config.handler {
                match plugin.handle_request(&mut session).await {
                    Ok(RequestAction::Forward) => {}
                    Ok(RequestAction::ReplaceRequest(request)) => session.request = request,
                    Ok(RequestAction::ShortCircuit(response)) => {
                        session.response = Some(response);
                        if let Err(err) = write_session_response(&mut session, false).await {
                            funnel_error(handler, Some(&session), &err).await;
                        }
                        return;
                    }
                    Err(err) => {
                        let err = ProxyError::Handler(format!("{err:#}"));
                        funnel_error(handler, Some(&session), &err).await;
                        return;
                    }
                }
            }

            let uri = session.request.uri();
            if uri.scheme().is_none() || uri.authority().is_none() {
                let err = ProxyError::InvalidUrl;
                funnel_error(handler, Some(&session), &err).await;
                session.response = Some(session.error_response(&err));
            } else {
                let result = match open_or_reuse(upstream, &session, config).await {
                    Ok(client) => client.send(clone_request(&session.request)).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(response) => session.response = Some(response),
                    Err(err) => {
                        let err = ProxyError::from(err);
                        funnel_error(handler, Some(&session), &err).await;
                        session.response = Some(session.error_response(&err));
                    }
                }
            }

            match write_with_handler(&mut session, config, true).await {
                Ok(()) => conn = session.into_conn(),
                Err(err) => {
                    funnel_error(handler, Some(&session), &err).await;
                    return;
                }
            }
        }
    }
}

/// Handles a CONNECT request after authentication: 200 reply, MITM
/// eligibility, one-byte TLS peek, and either interception or opaque
/// handoff.
async fn connect_tunnel(
    mut session: Session,
    config: &ProxyConfig,
    inbound: &InboundSender,
) -> ConnectOutcome {
    let handler = config.handler.as_deref();

    if let Err(err) =
        write_connect_established(&mut session.conn, session.request.version()).await
    {
        funnel_error(handler, Some(&session), &ProxyError::ClientWrite(err)).await;
        return ConnectOutcome::Closed;
    }

    let target = connect_target(&session.request);

    if let Some(factory) = config
        .cert_config
        .as_ref()
        .filter(|_| mitm_eligible_port(&target))
    {
        let mut first = [0u8; 1];
        match timeout(READ_DEADLINE, session.conn.read_exact(&mut first)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                let err = ProxyError::ClientRead(ReadError::Io(err));
                funnel_error(handler, Some(&session), &err).await;
                return ConnectOutcome::Closed;
            }
            Err(_) => {
                let err = ProxyError::ClientRead(ReadError::Io(io::ErrorKind::TimedOut.into()));
                funnel_error(handler, Some(&session), &err).await;
                return ConnectOutcome::Closed;
            }
        }
        // Re-serve the peeked byte ahead of anything still buffered; the
        // adapter is now the composite reader the TLS layer consumes.
        session.conn.rewind(&first);

        if first[0] == TLS_HANDSHAKE_CONTENT_TYPE {
            let host = http1::strip_port(&target).to_owned();
            let tls_config = match factory.tls_config_for_host(&host).await {
                Ok(tls_config) => tls_config,
                Err(err) => {
                    let err = ProxyError::TlsHandshake(io::Error::other(err));
                    funnel_error(handler, Some(&session), &err).await;
                    return ConnectOutcome::Closed;
                }
            };

            let Session { conn, .. } = session;
            return match timeout(READ_DEADLINE, TlsAcceptor::from(tls_config).accept(conn)).await
            {
                Ok(Ok(tls)) => ConnectOutcome::Intercepted(Box::new(tls)),
                Ok(Err(err)) => {
                    funnel_error(handler, None, &ProxyError::TlsHandshake(err)).await;
                    ConnectOutcome::Closed
                }
                Err(_) => {
                    let err = ProxyError::TlsHandshake(io::ErrorKind::TimedOut.into());
                    funnel_error(handler, None, &err).await;
                    ConnectOutcome::Closed
                }
            };
        }
        // First byte is not a TLS record: some other encrypted protocol.
        // Fall through to the opaque handoff with the byte preserved.
    }

    let Session {
        conn,
        request,
        source,
        ..
    } = session;
    let tunnel = TunnelRequest {
        target,
        source,
        request,
        stream: Box::new(conn),
    };
    if inbound.send(tunnel).await.is_err() {
        funnel_error(handler, None, &ProxyError::Upstream(UpstreamError::QueueClosed)).await;
        return ConnectOutcome::Closed;
    }
    ConnectOutcome::Handover
}

/// Writes the CONNECT success line, mirroring the client's HTTP version.
/// HTTP/1.0 clients (certain game launchers) reject a 1.1 status line here.
async fn write_connect_established<W>(writer: &mut W, version: Version) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (major, minor) = match version {
        Version::HTTP_10 => (1, 0),
        _ => (1, 1),
    };
    let line = format!("HTTP/{major}.{minor} 200 Connection established\r\n\r\n");
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Normalizes the request for upstream dispatch: authority from the request
/// target or `Host` header, scheme from the interception state, a single
/// tolerated `Accept-Encoding`, and hop-by-hop hygiene.
fn prepare_request(session: &mut Session) {
    let intercepted = session.intercepted;
    let request = &mut session.request;

    let scheme = if intercepted { "https" } else { "http" };
    let authority = request
        .uri()
        .authority()
        .map(|a| a.as_str().to_owned())
        .or_else(|| {
            request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        });

    if let Some(authority) = authority {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        if let Ok(uri) = Uri::builder()
            .scheme(scheme)
            .authority(authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
        {
            *request.uri_mut() = uri;
        }
    }

    // Refuse to proxy content codings we cannot transparently decode for
    // handler inspection.
    if request.headers().contains_key(header::ACCEPT_ENCODING) {
        request
            .headers_mut()
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }

    http1::remove_hop_by_hop_headers(request.headers_mut());
    http1::remove_extra_host_port(request);
}

async fn open_or_reuse(
    upstream: &mut Option<Arc<dyn Upstream>>,
    session: &Session,
    config: &ProxyConfig,
) -> Result<Arc<dyn Upstream>, UpstreamError> {
    if let Some(client) = upstream {
        return Ok(Arc::clone(client));
    }
    let user_agent = session
        .request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let client = config.dispatcher.open(session.source, &user_agent).await?;
    *upstream = Some(Arc::clone(&client));
    Ok(client)
}

/// Runs the response handler hook, then writes the session response.
async fn write_with_handler(
    session: &mut Session,
    config: &ProxyConfig,
    keep_alive: bool,
) -> Result<(), ProxyError> {
    if let Some(plugin) = &config.handler {
        match plugin.handle_response(session).await {
            Ok(Some(response)) => session.response = Some(response),
            Ok(None) => {}
            Err(err) => return Err(ProxyError::Handler(format!("{err:#}"))),
        }
    }
    write_session_response(session, keep_alive).await
}

/// Strips hop-by-hop headers and writes the response. With `keep_alive` the
/// advertised timeout (25 s) stays below the read deadline (30 s) so the
/// client closes first under clean shutdown. Never injects
/// `Connection: close`; that decision belongs to the handler.
async fn write_session_response(session: &mut Session, keep_alive: bool) -> Result<(), ProxyError> {
    if let Some(response) = session.response.as_mut() {
        http1::remove_hop_by_hop_headers(response.headers_mut());
        if keep_alive {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            response.headers_mut().insert(
                HeaderName::from_static("keep-alive"),
                HeaderValue::from_static("timeout=25"),
            );
        }
    }
    let (conn, response) = session.conn_and_response();
    let response = match response {
        Some(response) => response,
        None => return Ok(()),
    };
    http1::write_response(conn, response)
        .await
        .map_err(ProxyError::ClientWrite)
}

fn parse_source_address(value: &HeaderValue) -> Option<SocketAddr> {
    value.to_str().ok()?.trim().parse().ok()
}

fn connect_target(request: &Request<Bytes>) -> String {
    request
        .uri()
        .authority()
        .map(|a| a.as_str().to_owned())
        .unwrap_or_else(|| request.uri().to_string())
}

fn mitm_eligible_port(target: &str) -> bool {
    matches!(http1::split_host_port(target), Some((_, "443" | "8443")))
}

fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut cloned = Request::builder()
        .method(request.method().clone())
        .uri(request.uri().clone())
        .version(request.version())
        .body(request.body().clone())
        .expect("request from valid parts");
    *cloned.headers_mut() = request.headers().clone();
    cloned
}
