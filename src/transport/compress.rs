//! Streaming compression transport.
//!
//! Outermost layer of the stack. Every user write is compressed into one
//! self-contained, length-prefixed frame and pushed to the wire
//! immediately, so messages are visible to the peer without waiting for
//! block boundaries:
//!
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ compressed len (4) │ compressed block         │
//! └────────────────────┴──────────────────────────┘
//! ```
//!
//! Both tunnel endpoints are this software, which makes the framed block
//! format a private wire like the simplified SOCKS5 dialect. Block codecs:
//! `lz4`, `snappy` or `deflate`.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::addr::PeerIdentifier;
use crate::error::{Error, Result};
use crate::transport::{BoxConn, Conn, Listener, Transport};

/// Largest plaintext chunk that goes into a single frame.
const MAX_PLAIN: usize = 256 * 1024;

/// Largest acceptable compressed frame (worst-case expansion plus slack).
const MAX_FRAME: usize = MAX_PLAIN + MAX_PLAIN / 64 + 128;

/// Supported compression methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// LZ4 block format
    Lz4,
    /// Snappy raw block format
    Snappy,
    /// Raw DEFLATE blocks
    Deflate,
}

impl Method {
    /// Parse a configuration string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "lz4" => Ok(Method::Lz4),
            "snappy" => Ok(Method::Snappy),
            "deflate" => Ok(Method::Deflate),
            other => Err(Error::config(format!(
                "unknown compression method: {other}"
            ))),
        }
    }

    fn compress(self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Method::Lz4 => Ok(lz4_flex::block::compress_prepend_size(chunk)),
            Method::Snappy => snap::raw::Encoder::new()
                .compress_vec(chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Method::Deflate => {
                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::with_capacity(chunk.len() / 2 + 16),
                    flate2::Compression::default(),
                );
                encoder.write_all(chunk)?;
                encoder.finish()
            }
        }
    }

    fn decompress(self, frame: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Method::Lz4 => {
                // reject absurd declared sizes before allocating
                if frame.len() >= 4 {
                    let declared =
                        u32::from_le_bytes(frame[..4].try_into().expect("4 bytes")) as usize;
                    if declared > MAX_PLAIN {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "decompressed frame too large",
                        ));
                    }
                }
                lz4_flex::block::decompress_size_prepended(frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Method::Snappy => snap::raw::Decoder::new()
                .decompress_vec(frame)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Method::Deflate => {
                let mut plain = Vec::new();
                let mut decoder =
                    flate2::read::DeflateDecoder::new(frame).take(MAX_PLAIN as u64 + 1);
                decoder.read_to_end(&mut plain)?;
                if plain.len() > MAX_PLAIN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "decompressed frame too large",
                    ));
                }
                Ok(plain)
            }
        }
    }
}

/// Transport wrapper applying compression to every connection.
pub struct CompressionTransport {
    inner: Arc<dyn Transport>,
    method: Method,
}

impl CompressionTransport {
    /// Wrap `inner` with the named compression method.
    pub fn new(inner: Arc<dyn Transport>, method: &str) -> Result<Self> {
        Ok(CompressionTransport {
            inner,
            method: Method::parse(method)?,
        })
    }
}

#[async_trait]
impl Transport for CompressionTransport {
    async fn dial(&self, addr: &str) -> Result<BoxConn> {
        let conn = self.inner.dial(addr).await?;
        Ok(Box::new(CompressedConn::new(conn, self.method)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let inner = self.inner.listen(addr).await?;
        Ok(Box::new(CompressedListener {
            inner,
            method: self.method,
        }))
    }
}

struct CompressedListener {
    inner: Box<dyn Listener>,
    method: Method,
}

#[async_trait]
impl Listener for CompressedListener {
    async fn accept(&mut self) -> Result<BoxConn> {
        let conn = self.inner.accept().await?;
        Ok(Box::new(CompressedConn::new(conn, self.method)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// A connection whose bytes are framed and compressed.
pub struct CompressedConn<S> {
    inner: S,
    method: Method,

    // read side
    rheader: [u8; 4],
    rheader_filled: usize,
    rframe: Vec<u8>,
    rframe_filled: usize,
    rplain: Vec<u8>,
    rplain_offset: usize,

    // write side
    pending: Vec<u8>,
    pending_offset: usize,
}

impl<S> CompressedConn<S> {
    /// Wrap a single stream.
    pub fn new(inner: S, method: Method) -> Self {
        CompressedConn {
            inner,
            method,
            rheader: [0u8; 4],
            rheader_filled: 0,
            rframe: Vec::new(),
            rframe_filled: 0,
            rplain: Vec::new(),
            rplain_offset: 0,
            pending: Vec::new(),
            pending_offset: 0,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncRead for CompressedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // serve decompressed bytes first
            if this.rplain_offset < this.rplain.len() {
                let n = (this.rplain.len() - this.rplain_offset).min(buf.remaining());
                buf.put_slice(&this.rplain[this.rplain_offset..this.rplain_offset + n]);
                this.rplain_offset += n;
                if this.rplain_offset == this.rplain.len() {
                    this.rplain.clear();
                    this.rplain_offset = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if this.rheader_filled < 4 {
                let mut tmp = [0u8; 4];
                let want = 4 - this.rheader_filled;
                let mut rb = ReadBuf::new(&mut tmp[..want]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                let n = rb.filled().len();
                if n == 0 {
                    if this.rheader_filled == 0 {
                        return Poll::Ready(Ok(())); // clean EOF between frames
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.rheader[this.rheader_filled..this.rheader_filled + n]
                    .copy_from_slice(rb.filled());
                this.rheader_filled += n;
                if this.rheader_filled < 4 {
                    continue;
                }
                let frame_len = u32::from_be_bytes(this.rheader) as usize;
                if frame_len == 0 || frame_len > MAX_FRAME {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid compressed frame length: {frame_len}"),
                    )));
                }
                this.rframe = vec![0u8; frame_len];
                this.rframe_filled = 0;
            }

            // collect the compressed frame body
            while this.rframe_filled < this.rframe.len() {
                let mut rb = ReadBuf::new(&mut this.rframe[this.rframe_filled..]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                let n = rb.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.rframe_filled += n;
            }

            this.rplain = this.method.decompress(&this.rframe)?;
            this.rplain_offset = 0;
            this.rframe = Vec::new();
            this.rframe_filled = 0;
            this.rheader_filled = 0;
            // loop: either serve the plaintext or read the next frame if
            // this one was empty
        }
    }
}

fn poll_drain_pending<S: AsyncWrite + Unpin>(
    inner: &mut S,
    pending: &mut Vec<u8>,
    offset: &mut usize,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while *offset < pending.len() {
        match Pin::new(&mut *inner).poll_write(cx, &pending[*offset..]) {
            Poll::Ready(Ok(0)) => {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            Poll::Ready(Ok(n)) => *offset += n,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }
    pending.clear();
    *offset = 0;
    Poll::Ready(Ok(()))
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncWrite for CompressedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match poll_drain_pending(&mut this.inner, &mut this.pending, &mut this.pending_offset, cx)
        {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_PLAIN)];
        let compressed = this.method.compress(chunk)?;
        let mut frame = Vec::with_capacity(4 + compressed.len());
        frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&compressed);

        let mut offset = 0;
        loop {
            match Pin::new(&mut this.inner).poll_write(cx, &frame[offset..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    offset += n;
                    if offset == frame.len() {
                        return Poll::Ready(Ok(chunk.len()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    // the frame is committed; it finishes before later writes
                    this.pending = frame;
                    this.pending_offset = offset;
                    return Poll::Ready(Ok(chunk.len()));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match poll_drain_pending(&mut this.inner, &mut this.pending, &mut this.pending_offset, cx)
        {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match poll_drain_pending(&mut this.inner, &mut this.pending, &mut this.pending_offset, cx)
        {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: Conn> Conn for CompressedConn<S> {
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        self.inner.peer_identifiers()
    }

    fn peer_addr_text(&self) -> String {
        self.inner.peer_addr_text()
    }
}
