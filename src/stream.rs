//! Buffered client connection adapter.
//!
//! [`BufferedStream`] wraps the client-side stream for the lifetime of a
//! session. It accumulates input ahead of the HTTP parser, answers how many
//! bytes are buffered but not yet consumed, and can push bytes back to the
//! front of the buffer so that a peeked byte is re-served in order. The TLS
//! interception path relies on this: after the one-byte peek, rewinding the
//! byte makes the adapter itself the composite reader
//! `[peeked byte] ++ [buffered remainder] ++ [live stream]`.
//!
//! Writes and shutdown pass straight through to the underlying stream;
//! closing the adapter closes the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Marker trait for the duplex byte streams a session can own: the raw TCP
/// connection, an in-memory test stream, or a TLS-terminated wrapper around
/// either.
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> SessionIo for T {}

/// A boxed session stream; ownership moves between the session loop, the TLS
/// layer, and the inbound queue.
pub type BoxedIo = Box<dyn SessionIo>;

/// A buffering wrapper around a duplex stream.
pub struct BufferedStream<S> {
    inner: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// The unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Pushes `bytes` back to the front of the buffer so they are served
    /// before anything currently buffered. The only copy in the peek path is
    /// this one small slice.
    pub fn rewind(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(bytes.len() + self.buf.len());
        merged.extend_from_slice(bytes);
        merged.extend_from_slice(&self.buf);
        self.buf = merged;
    }

    /// Reads more data from the inner stream into the buffer. Returns the
    /// number of bytes read; 0 means the peer closed the connection.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.inner.read_buf(&mut self.buf).await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
