//! Connection handed out by a sub-listener.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connection whose sniffed prefix is replayed before the socket is read
/// again.
///
/// Whatever the multiplexer read while matching is returned first, so the
/// HTTP parser or TLS handshake that owns the stream sees every byte the
/// peer sent, in order.
#[derive(Debug)]
pub struct MuxStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
    peer: String,
}

impl<S> MuxStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S, peer: impl Into<String>) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
            peer: peer.into(),
        }
    }

    /// Address of the remote end, as reported by the base listener.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Bytes read while matching that have not been replayed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.prefix[self.pos..]
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Returns the unreplayed prefix and the raw connection.
    pub fn into_parts(mut self) -> (Vec<u8>, S) {
        let rest = self.prefix.split_off(self.pos);
        (rest, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MuxStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let available = &self.prefix[self.pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            self.pos += n;

            if self.pos == self.prefix.len() {
                // Replay done; release the buffer.
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MuxStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
