//! Replaying consumed bytes ahead of a live stream.
//!
//! Every accepted connection is wrapped in [`Rewind`] before the first
//! sniffing read. Bytes the sniffer consumed can then be pushed back with
//! [`Rewind::unread`], and the next owner of the connection reads them again
//! followed by the untouched remainder of the stream. No access to the
//! internals of any transport layer (TLS or otherwise) is needed: whatever
//! the inner stream already decrypted and returned is held here.

use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::conn::Connection;

/// A connection whose reads replay a prefix before reaching the inner stream.
#[derive(Debug)]
pub struct Rewind<C> {
    inner: C,
    /// Replay buffer; bytes before `pos` have been read.
    replay: Vec<u8>,
    pos: usize,
    /// Inner read error hit while topping up a replayed read.
    deferred_error: Option<io::Error>,
}

/// Produce a connection that yields `prefix` and then the rest of `conn`.
pub fn rewind<C>(conn: C, prefix: &[u8]) -> Rewind<C> {
    Rewind::with_prefix(conn, prefix.to_vec())
}

impl<C> Rewind<C> {
    /// Wrap a connection with an empty replay buffer.
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            replay: Vec::new(),
            pos: 0,
            deferred_error: None,
        }
    }

    /// Wrap a connection that must yield `prefix` first.
    pub fn with_prefix(inner: C, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            replay: prefix,
            pos: 0,
            deferred_error: None,
        }
    }

    /// Push `prefix` back so it is the next thing read.
    ///
    /// When the bytes just before the cursor are exactly `prefix` (they were
    /// served from the replay buffer) only the cursor moves. Otherwise the
    /// replay buffer is rebuilt as `prefix` followed by whatever was still
    /// unread.
    pub fn unread(&mut self, prefix: &[u8]) {
        if prefix.is_empty() {
            return;
        }

        if self.pos >= prefix.len() && self.replay[self.pos - prefix.len()..self.pos] == *prefix {
            self.pos -= prefix.len();
            return;
        }

        let mut replay = Vec::with_capacity(prefix.len() + self.buffered());
        replay.extend_from_slice(prefix);
        replay.extend_from_slice(&self.replay[self.pos..]);
        self.replay = replay;
        self.pos = 0;
    }

    /// Number of replay bytes not yet read.
    pub fn buffered(&self) -> usize {
        self.replay.len() - self.pos
    }

    /// Get a reference to the inner connection.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Get a mutable reference to the inner connection.
    ///
    /// Reading from it directly skips any pending replay bytes.
    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    /// Unwrap into the inner connection and the unread replay bytes.
    pub fn into_inner(self) -> (C, Vec<u8>) {
        let mut replay = self.replay;
        replay.drain(..self.pos);
        (self.inner, replay)
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for Rewind<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.deferred_error.take() {
            return Poll::Ready(Err(err));
        }

        if this.pos >= this.replay.len() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let remaining = &this.replay[this.pos..];
        let to_copy = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_copy]);
        this.pos += to_copy;

        if this.pos < this.replay.len() {
            return Poll::Ready(Ok(()));
        }
        this.replay = Vec::new();
        this.pos = 0;

        // Top up from the live stream if it has data ready, so the replayed
        // prefix and whatever the peer already sent arrive together.
        if buf.remaining() > 0 {
            if let Poll::Ready(Err(err)) = Pin::new(&mut this.inner).poll_read(cx, buf) {
                this.deferred_error = Some(err);
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for Rewind<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<C: Connection> Connection for Rewind<C> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
