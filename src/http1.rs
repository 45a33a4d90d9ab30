//! HTTP/1.x wire handling for the session loop.
//!
//! Requests arrive in absolute-form (proxy form), origin-form (after TLS
//! interception), or authority-form (CONNECT). The reader parses the header
//! section incrementally from the buffered adapter, then drains the body by
//! `Content-Length` or chunked framing so the whole message can be handed to
//! the handler and the upstream dispatcher as one unit.

use std::io;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, Uri, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::stream::BufferedStream;

/// Ceiling for a request header section.
pub(crate) const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Ceiling for a buffered request body.
pub(crate) const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const MAX_HEADER_COUNT: usize = 64;

/// Hop-by-hop headers stripped from both directions. `Proxy-Authenticate` is
/// deliberately absent: the 407 challenge must survive the response writer.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Errors while reading a request from the client.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("client closed the connection")]
    Closed,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request header section exceeds {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,

    #[error("request body exceeds {MAX_BODY_BYTES} bytes")]
    BodyTooLarge,
}

/// Reads one HTTP/1.x request, header section and body, from the stream.
pub async fn read_request<S>(conn: &mut BufferedStream<S>) -> Result<Request<Bytes>, ReadError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (header_len, request) = loop {
        if let Some(parsed) = parse_header_section(conn.buffer())? {
            break parsed;
        }
        if conn.buffered() >= MAX_HEADER_BYTES {
            return Err(ReadError::HeadersTooLarge);
        }
        if conn.fill().await? == 0 {
            return Err(ReadError::Closed);
        }
    };
    conn.consume(header_len);

    let body = read_body(conn, request.headers()).await?;
    Ok(request.map(|_| body))
}

/// Parses a complete header section out of `buf`, or `None` when more input
/// is needed. Returns the section length and the request with an empty body.
fn parse_header_section(buf: &[u8]) -> Result<Option<(usize, Request<()>)>, ReadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut parsed = httparse::Request::new(&mut headers);
    let header_len = match parsed.parse(buf) {
        Ok(httparse::Status::Partial) => return Ok(None),
        Ok(httparse::Status::Complete(len)) => len,
        Err(err) => return Err(ReadError::Malformed(err.to_string())),
    };

    let method: Method = parsed
        .method
        .ok_or_else(|| ReadError::Malformed("missing method".into()))?
        .parse()
        .map_err(|_| ReadError::Malformed("invalid method".into()))?;
    let uri: Uri = parsed
        .path
        .ok_or_else(|| ReadError::Malformed("missing request target".into()))?
        .parse()
        .map_err(|_| ReadError::Malformed("invalid request target".into()))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .version(version)
        .body(())
        .map_err(|err| ReadError::Malformed(err.to_string()))?;
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ReadError::Malformed(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| ReadError::Malformed(format!("invalid value for header {}", h.name)))?;
        request.headers_mut().append(name, value);
    }

    Ok(Some((header_len, request)))
}

async fn read_body<S>(conn: &mut BufferedStream<S>, headers: &HeaderMap) -> Result<Bytes, ReadError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if is_chunked(headers) {
        return read_chunked_body(conn).await;
    }

    let len = match headers.get(header::CONTENT_LENGTH) {
        None => return Ok(Bytes::new()),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| ReadError::Malformed("invalid Content-Length".into()))?,
    };
    if len == 0 {
        return Ok(Bytes::new());
    }
    if len > MAX_BODY_BYTES {
        return Err(ReadError::BodyTooLarge);
    }

    let mut body = vec![0u8; len];
    conn.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

async fn read_chunked_body<S>(conn: &mut BufferedStream<S>) -> Result<Bytes, ReadError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size_line = read_line(conn).await?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ReadError::Malformed(format!("invalid chunk size {size_str:?}")))?;
        if size == 0 {
            break;
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Err(ReadError::BodyTooLarge);
        }
        let start = body.len();
        body.resize(start + size, 0);
        conn.read_exact(&mut body[start..]).await?;
        expect_crlf(conn).await?;
    }
    // Trailer section: discard lines up to the terminating blank line.
    loop {
        if read_line(conn).await?.is_empty() {
            break;
        }
    }
    Ok(Bytes::from(body))
}

async fn read_line<S>(conn: &mut BufferedStream<S>) -> Result<String, ReadError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = conn.read_u8().await?;
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line)
                .map_err(|_| ReadError::Malformed("non-ascii chunk framing".into()));
        }
        line.push(byte);
        if line.len() > 256 {
            return Err(ReadError::Malformed("chunk framing line too long".into()));
        }
    }
}

async fn expect_crlf<S>(conn: &mut BufferedStream<S>) -> Result<(), ReadError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut crlf = [0u8; 2];
    conn.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
        return Err(ReadError::Malformed("missing CRLF after chunk".into()));
    }
    Ok(())
}

/// Serializes a response to the client in HTTP/1.x wire format. The body is
/// framed with an explicit `Content-Length`; any transfer coding was already
/// stripped with the hop-by-hop headers.
pub async fn write_response<W>(writer: &mut W, response: &Response<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let version = match response.version() {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("");

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(version.as_bytes());
    head.extend_from_slice(format!(" {} {}\r\n", status.as_u16(), reason).as_bytes());
    for (name, value) in response.headers() {
        if name == header::CONTENT_LENGTH {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if !(status.is_informational() || status == http::StatusCode::NO_CONTENT) {
        head.extend_from_slice(format!("Content-Length: {}\r\n", response.body().len()).as_bytes());
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head).await?;
    if !response.body().is_empty() {
        writer.write_all(response.body()).await?;
    }
    writer.flush().await
}

/// Removes hop-by-hop headers: the fixed set plus any header nominated in
/// `Connection`.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Drops a redundant default port from the `Host` header and the request
/// authority (`example.com:80` for http, `example.com:443` for https).
pub fn remove_extra_host_port(request: &mut Request<Bytes>) {
    let default_port = match request.uri().scheme_str() {
        Some("https") => "443",
        _ => "80",
    };
    let host = match request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        Some(host) => host.to_owned(),
        None => return,
    };
    let (bare, port) = match split_host_port(&host) {
        Some(parts) => parts,
        None => return,
    };
    if port != default_port {
        return;
    }

    let bare = bare.to_owned();
    if let Ok(value) = HeaderValue::from_str(&bare) {
        request.headers_mut().insert(header::HOST, value);
    }
    let mut parts = request.uri().clone().into_parts();
    if let Ok(authority) = bare.parse() {
        parts.authority = Some(authority);
        if let Ok(uri) = Uri::from_parts(parts) {
            *request.uri_mut() = uri;
        }
    }
}

/// Splits `host:port`, honoring IPv6 bracket syntax. Returns `None` when no
/// explicit port is present.
pub(crate) fn split_host_port(host: &str) -> Option<(&str, &str)> {
    let (bare, port) = host.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if bare.contains(':') && !(bare.starts_with('[') && bare.ends_with(']')) {
        // Colon inside an unbracketed IPv6 literal, not a port separator.
        return None;
    }
    Some((bare, port))
}

/// The hostname a request addresses, with any port stripped: the request
/// authority when present, else the `Host` header.
pub(crate) fn request_hostname(request: &Request<Bytes>) -> Option<String> {
    let host = request
        .uri()
        .authority()
        .map(|a| a.as_str().to_owned())
        .or_else(|| {
            request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })?;
    Some(strip_port(&host).to_owned())
}

pub(crate) fn strip_port(host: &str) -> &str {
    match split_host_port(host) {
        Some((bare, _)) => bare,
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    async fn read(raw: &[u8]) -> Result<Request<Bytes>, ReadError> {
        let mut conn = BufferedStream::new(Cursor::new(raw.to_vec()));
        read_request(&mut conn).await
    }

    #[tokio::test]
    async fn parses_absolute_form_request() {
        let req = read(b"GET http://example.test/index.html HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().scheme_str(), Some("http"));
        assert_eq!(req.uri().host(), Some("example.test"));
        assert_eq!(req.uri().path(), "/index.html");
        assert_eq!(req.version(), Version::HTTP_11);
    }

    #[tokio::test]
    async fn parses_origin_form_request() {
        let req = read(b"GET /search?q=1 HTTP/1.0\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();
        assert!(req.uri().scheme().is_none());
        assert_eq!(req.uri().path(), "/search");
        assert_eq!(req.version(), Version::HTTP_10);
    }

    #[tokio::test]
    async fn parses_connect_authority_form() {
        let req = read(b"CONNECT site.test:443 HTTP/1.1\r\nHost: site.test:443\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method(), Method::CONNECT);
        assert_eq!(
            req.uri().authority().map(|a| a.as_str()),
            Some("site.test:443")
        );
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let req = read(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(req.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn reads_chunked_body_with_trailers() {
        let raw = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4\r\nwiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let req = read(raw).await.unwrap();
        assert_eq!(req.body().as_ref(), b"wikipedia");
    }

    #[tokio::test]
    async fn rejects_oversized_declared_body() {
        let raw = format!(
            "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        assert!(matches!(
            read(raw.as_bytes()).await,
            Err(ReadError::BodyTooLarge)
        ));
    }

    #[tokio::test]
    async fn clean_close_is_reported() {
        assert!(matches!(read(b"").await, Err(ReadError::Closed)));
    }

    #[test]
    fn hop_by_hop_removes_fixed_set_and_nominated() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, x-trace".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-trace", "abc".parse().unwrap());
        headers.insert("proxy-authorization", "Basic xyz".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("proxy-authenticate", "Basic".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());

        remove_hop_by_hop_headers(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-trace").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        // The 407 challenge header is not hop-by-hop for our purposes.
        assert!(headers.get("proxy-authenticate").is_some());
        assert!(headers.get("accept").is_some());
    }

    #[test]
    fn strips_redundant_default_port() {
        let mut request = Request::builder()
            .uri("http://example.test:80/path")
            .header(header::HOST, "example.test:80")
            .body(Bytes::new())
            .unwrap();
        remove_extra_host_port(&mut request);
        assert_eq!(request.headers()[header::HOST], "example.test");
        assert_eq!(request.uri().authority().map(|a| a.as_str()), Some("example.test"));
        assert_eq!(request.uri().path(), "/path");
    }

    #[test]
    fn keeps_explicit_non_default_port() {
        let mut request = Request::builder()
            .uri("http://example.test:8080/")
            .header(header::HOST, "example.test:8080")
            .body(Bytes::new())
            .unwrap();
        remove_extra_host_port(&mut request);
        assert_eq!(request.headers()[header::HOST], "example.test:8080");
    }

    #[test]
    fn split_host_port_handles_ipv6() {
        assert_eq!(split_host_port("example.test:443"), Some(("example.test", "443")));
        assert_eq!(split_host_port("[::1]:443"), Some(("[::1]", "443")));
        assert_eq!(split_host_port("example.test"), None);
        assert_eq!(split_host_port("::1"), None);
    }

    #[tokio::test]
    async fn write_response_emits_wire_format() {
        let response = Response::builder()
            .status(http::StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Bytes::from_static(b"ok"))
            .unwrap();
        let mut out = Cursor::new(Vec::new());
        write_response(&mut out, &response).await.unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }
}
