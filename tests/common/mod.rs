//! Shared harness: an in-memory client connection wired to `handle_conn`,
//! with recording doubles for the upstream dispatcher and the handler.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use middleman::inbound::TunnelRequest;
use middleman::session::handle_conn;
use middleman::upstream::{Dispatcher, Upstream, UpstreamError};
use middleman::{AuthCache, ProxyConfig, ProxyError, ProxyHandler};

pub const API_HOST: &str = "middleman.internal";
pub const PEER: &str = "192.0.2.1:50000";

/// Upstream double returning a canned response and recording what it saw.
pub struct RecordingUpstream {
    pub requests: Mutex<Vec<Request<Bytes>>>,
    pub released: AtomicBool,
    fail: bool,
}

impl RecordingUpstream {
    pub fn ok() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }
}

#[async_trait]
impl Upstream for RecordingUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, UpstreamError> {
        self.requests.lock().await.push(request);
        if self.fail {
            return Err(UpstreamError::Request("connection refused".into()));
        }
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Bytes::from_static(b"ok"))
            .unwrap())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Dispatcher double recording the `(source, user_agent)` keys it was asked
/// to open.
pub struct RecordingDispatcher {
    pub upstream: Arc<RecordingUpstream>,
    pub opened: Mutex<Vec<(SocketAddr, String)>>,
}

impl RecordingDispatcher {
    pub fn new(upstream: Arc<RecordingUpstream>) -> Self {
        Self {
            upstream,
            opened: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn open(
        &self,
        source: SocketAddr,
        user_agent: &str,
    ) -> Result<Arc<dyn Upstream>, UpstreamError> {
        self.opened.lock().await.push((source, user_agent.to_owned()));
        Ok(Arc::clone(&self.upstream) as Arc<dyn Upstream>)
    }
}

/// Handler double collecting funneled error messages.
#[derive(Default)]
pub struct ErrorRecorder {
    pub errors: Mutex<Vec<String>>,
}

#[async_trait]
impl ProxyHandler for ErrorRecorder {
    async fn handle_error(&self, _session: Option<&middleman::Session>, error: &ProxyError) {
        self.errors.lock().await.push(error.to_string());
    }
}

/// One proxied connection under test.
pub struct TestProxy {
    pub client: DuplexStream,
    pub inbound: mpsc::Receiver<TunnelRequest>,
    pub upstream: Arc<RecordingUpstream>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub task: JoinHandle<()>,
}

/// Spawns `handle_conn` over an in-memory duplex stream. The returned
/// dispatcher double replaces whatever the config carried.
pub fn spawn_session(config: ProxyConfig, cache: Option<Arc<AuthCache>>) -> TestProxy {
    spawn_session_with(config, cache, Arc::new(RecordingUpstream::ok()))
}

pub fn spawn_session_with(
    config: ProxyConfig,
    cache: Option<Arc<AuthCache>>,
    upstream: Arc<RecordingUpstream>,
) -> TestProxy {
    let dispatcher = Arc::new(RecordingDispatcher::new(Arc::clone(&upstream)));
    let config = config.with_dispatcher(Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);

    let (client, server) = duplex(64 * 1024);
    let (inbound_tx, inbound_rx) = mpsc::channel(4);
    let peer: SocketAddr = PEER.parse().unwrap();
    let task = tokio::spawn(handle_conn(
        server,
        peer,
        Arc::new(config),
        inbound_tx,
        cache,
    ));

    TestProxy {
        client,
        inbound: inbound_rx,
        upstream,
        dispatcher,
        task,
    }
}

/// Reads a response header section, byte by byte, up to the blank line.
pub async fn read_response_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(
            n > 0,
            "connection closed mid header section: {:?}",
            String::from_utf8_lossy(&head)
        );
        head.extend_from_slice(&byte);
    }
    String::from_utf8(head).unwrap()
}

pub fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

pub fn has_header(head: &str, name: &str, value: &str) -> bool {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(n, v)| n.trim().eq_ignore_ascii_case(name) && v.trim() == value)
}

/// Reads a full response: header section plus `Content-Length` body.
pub async fn read_response<R: AsyncRead + Unpin>(stream: &mut R) -> (String, Vec<u8>) {
    let head = read_response_head(stream).await;
    let mut body = vec![0u8; content_length(&head)];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

/// Asserts the stream is at a clean EOF (the proxy closed the connection).
pub async fn expect_eof<R: AsyncRead + Unpin>(stream: &mut R) {
    let mut byte = [0u8; 1];
    let n = stream.read(&mut byte).await.unwrap();
    assert_eq!(n, 0, "expected connection close, got {:#x}", byte[0]);
}
