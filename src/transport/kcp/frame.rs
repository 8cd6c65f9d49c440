//! Inner framing on top of the reliable byte stream.
//!
//! The session layer is stream-mode, but close and keepalive signalling
//! need message boundaries. Three frame kinds:
//!
//! ```text
//! 0x00 DATA       type(1) len(4 be) payload
//! 0x01 CLOSE      type(1), signals end of stream
//! 0x02 KEEPALIVE  type(1), ignored by the reader
//! ```
//!
//! Any other leading byte is a fatal framing error. A CLOSE mid-stream
//! surfaces as end-of-stream; later reads keep returning end-of-stream.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::addr::PeerIdentifier;
use crate::bufpool::{self, PooledBuf};
use crate::error::Result;
use crate::transport::Conn;

pub(super) const FRAME_DATA: u8 = 0x00;
pub(super) const FRAME_CLOSE: u8 = 0x01;
pub(super) const FRAME_KEEPALIVE: u8 = 0x02;

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Send/read-block timestamps shared with the keepalive manager.
///
/// `last_send == 0` marks the connection as closed.
pub struct ConnClocks {
    last_send: AtomicI64,
    last_block_start: AtomicI64,
}

impl ConnClocks {
    /// Fresh clocks; `last_send` starts at now.
    pub fn new() -> Self {
        ConnClocks {
            last_send: AtomicI64::new(now_ns()),
            last_block_start: AtomicI64::new(0),
        }
    }

    /// Record a completed data or keepalive send.
    pub fn mark_send(&self) {
        self.last_send.store(now_ns(), Ordering::Relaxed);
    }

    /// Mark the connection closed.
    pub fn mark_closed(&self) {
        self.last_send.store(0, Ordering::Relaxed);
    }

    /// UNIX nanoseconds of the last send, 0 when closed.
    pub fn last_send_ns(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    /// UNIX nanoseconds since the current read started blocking, 0 when
    /// not blocked.
    pub fn last_block_start_ns(&self) -> i64 {
        self.last_block_start.load(Ordering::Relaxed)
    }

    fn block_enter(&self) {
        if self.last_block_start.load(Ordering::Relaxed) == 0 {
            self.last_block_start.store(now_ns(), Ordering::Relaxed);
        }
    }

    fn block_exit(&self) {
        self.last_block_start.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(super) fn force_block_start(&self, ns: i64) {
        self.last_block_start.store(ns, Ordering::Relaxed);
    }
}

impl Default for ConnClocks {
    fn default() -> Self {
        ConnClocks::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadState {
    /// Waiting for a frame header
    Header,
    /// Inside a DATA frame body
    Body,
    /// CLOSE received or the underlying stream ended
    Eof,
}

struct PendingWrite {
    data: PooledBuf,
    offset: usize,
}

/// A framed connection over a reliable inner stream.
pub struct KcpConn<S> {
    inner: S,
    clocks: Arc<ConnClocks>,
    read_state: ReadState,
    header: [u8; 5],
    header_filled: usize,
    body_remaining: u32,
    pending: Option<PendingWrite>,
    close_sent: bool,
}

impl<S> KcpConn<S> {
    /// Frame an inner stream, sharing `clocks` with the keepalive manager.
    pub fn new(inner: S, clocks: Arc<ConnClocks>) -> Self {
        KcpConn {
            inner,
            clocks,
            read_state: ReadState::Header,
            header: [0u8; 5],
            header_filled: 0,
            body_remaining: 0,
            pending: None,
            close_sent: false,
        }
    }

    /// The shared clocks of this connection.
    pub fn clocks(&self) -> &Arc<ConnClocks> {
        &self.clocks
    }
}

fn poll_read_clocked<S: AsyncRead + Unpin>(
    inner: &mut S,
    clocks: &ConnClocks,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>> {
    clocks.block_enter();
    let polled = Pin::new(inner).poll_read(cx, buf);
    if polled.is_ready() {
        clocks.block_exit();
    }
    polled
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncRead for KcpConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.read_state {
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Header => {
                    if this.header_filled == 0 {
                        let mut byte = [0u8; 1];
                        let mut rb = ReadBuf::new(&mut byte);
                        match poll_read_clocked(&mut this.inner, &this.clocks, cx, &mut rb) {
                            Poll::Ready(Ok(())) => {}
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                        if rb.filled().is_empty() {
                            // underlying stream ended at a frame boundary
                            this.read_state = ReadState::Eof;
                            continue;
                        }
                        match byte[0] {
                            FRAME_CLOSE => {
                                this.clocks.mark_closed();
                                this.read_state = ReadState::Eof;
                            }
                            FRAME_KEEPALIVE => {}
                            FRAME_DATA => {
                                this.header[0] = FRAME_DATA;
                                this.header_filled = 1;
                            }
                            other => {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("invalid frame header {other:#04x}"),
                                )));
                            }
                        }
                        continue;
                    }

                    // collect the 4-byte length of a DATA frame
                    let mut tmp = [0u8; 4];
                    let want = 5 - this.header_filled;
                    let mut rb = ReadBuf::new(&mut tmp[..want]);
                    match poll_read_clocked(&mut this.inner, &this.clocks, cx, &mut rb) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    this.header[this.header_filled..this.header_filled + n]
                        .copy_from_slice(rb.filled());
                    this.header_filled += n;
                    if this.header_filled == 5 {
                        this.body_remaining = u32::from_be_bytes(
                            this.header[1..5].try_into().expect("4 bytes"),
                        );
                        this.header_filled = 0;
                        if this.body_remaining > 0 {
                            this.read_state = ReadState::Body;
                        }
                    }
                }
                ReadState::Body => {
                    let mut tmp = [0u8; 8192];
                    let want = (this.body_remaining as usize)
                        .min(buf.remaining())
                        .min(tmp.len());
                    let mut rb = ReadBuf::new(&mut tmp[..want]);
                    match poll_read_clocked(&mut this.inner, &this.clocks, cx, &mut rb) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    buf.put_slice(rb.filled());
                    this.body_remaining -= n as u32;
                    if this.body_remaining == 0 {
                        this.read_state = ReadState::Header;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

fn poll_drain<S: AsyncWrite + Unpin>(
    inner: &mut S,
    pending: &mut Option<PendingWrite>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while let Some(p) = pending {
        match Pin::new(&mut *inner).poll_write(cx, &p.data[p.offset..]) {
            Poll::Ready(Ok(0)) => {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            Poll::Ready(Ok(n)) => {
                p.offset += n;
                if p.offset == p.data.len() {
                    *pending = None;
                }
            }
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }
    Poll::Ready(Ok(()))
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncWrite for KcpConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match poll_drain(&mut this.inner, &mut this.pending, cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if buf.len() > u32::MAX as usize {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send buffer size exceeds limitation",
            )));
        }

        // one user write becomes one DATA frame, header included in the
        // pooled allocation
        let mut frame = bufpool::get(buf.len() + 5);
        frame[0] = FRAME_DATA;
        frame[1..5].copy_from_slice(&(buf.len() as u32).to_be_bytes());
        frame[5..].copy_from_slice(buf);

        let mut offset = 0;
        loop {
            match Pin::new(&mut this.inner).poll_write(cx, &frame[offset..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    offset += n;
                    if offset == frame.len() {
                        this.clocks.mark_send();
                        return Poll::Ready(Ok(buf.len()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    // the frame is committed; finish it before later writes
                    this.pending = Some(PendingWrite {
                        data: frame,
                        offset,
                    });
                    this.clocks.mark_send();
                    return Poll::Ready(Ok(buf.len()));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match poll_drain(&mut this.inner, &mut this.pending, cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match poll_drain(&mut this.inner, &mut this.pending, cx) {
            Poll::Ready(_) => {}
            Poll::Pending => return Poll::Pending,
        }
        if !this.close_sent {
            // best-effort CLOSE notification
            match Pin::new(&mut this.inner).poll_write(cx, &[FRAME_CLOSE]) {
                Poll::Ready(_) => {}
                Poll::Pending => return Poll::Pending,
            }
            this.close_sent = true;
            this.clocks.mark_closed();
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: Conn> Conn for KcpConn<S> {
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        self.inner.peer_identifiers()
    }

    fn peer_addr_text(&self) -> String {
        self.inner.peer_addr_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn framed_pair() -> (
        KcpConn<tokio::io::DuplexStream>,
        KcpConn<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            KcpConn::new(a, Arc::new(ConnClocks::new())),
            KcpConn::new(b, Arc::new(ConnClocks::new())),
        )
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (mut a, mut b) = framed_pair();
        for len in [1usize, 2, 100, 4096, 70_000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            a.write_all(&data).await.unwrap();
            let mut got = vec![0u8; len];
            b.read_exact(&mut got).await.unwrap();
            assert_eq!(got, data, "len {len}");
        }
    }

    #[tokio::test]
    async fn test_close_surfaces_as_eof() {
        let (mut a, mut b) = framed_pair();
        a.write_all(b"tail").await.unwrap();
        a.shutdown().await.unwrap();

        let mut got = [0u8; 4];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"tail");

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
        // reads after end-of-stream stay at end-of-stream
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_bytes_are_skipped() {
        let (a, mut b) = framed_pair();
        let mut raw = a.inner;
        raw.write_all(&[FRAME_KEEPALIVE, FRAME_KEEPALIVE]).await.unwrap();
        raw.write_all(&[FRAME_DATA, 0, 0, 0, 2, b'h', b'i']).await.unwrap();

        let mut got = [0u8; 2];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi");
    }

    #[tokio::test]
    async fn test_invalid_frame_byte_is_fatal() {
        let (a, mut b) = framed_pair();
        let mut raw = a.inner;
        raw.write_all(&[0x7f]).await.unwrap();

        let mut buf = [0u8; 8];
        let err = b.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (a, mut b) = framed_pair();
        let mut raw = a.inner;
        raw.write_all(&[FRAME_DATA, 0, 0, 0, 10, b'x']).await.unwrap();
        drop(raw);

        let mut buf = [0u8; 16];
        // the first byte arrives, then the stream dies mid-frame
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(n, 1);
        let err = b.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_clocks_track_sends() {
        let (mut a, _b) = framed_pair();
        let before = a.clocks().last_send_ns();
        tokio::time::sleep(Duration::from_millis(5)).await;
        a.write_all(b"bump").await.unwrap();
        assert!(a.clocks().last_send_ns() > before);

        a.shutdown().await.unwrap();
        assert_eq!(a.clocks().last_send_ns(), 0);
    }
}
