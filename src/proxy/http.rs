//! HTTP CONNECT upstream client.
//!
//! The minimal alternative upstream protocol: one CONNECT request, one
//! status line, drain the remaining response headers, then the stream is
//! raw bytes.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::TcpStream;

use crate::addr::{Address, PeerIdentifier};
use crate::error::{Error, ProxyError, ProxyErrorKind, ProxyResult, Result};
use crate::proxy::ProxyClient;
use crate::transport::{BoxConn, Conn};

/// Upper bound on a response header line.
const MAX_LINE: usize = 16 * 1024;

/// A `ProxyClient` speaking HTTP CONNECT.
pub struct HttpTunnelClient {
    addr: String,
}

impl HttpTunnelClient {
    /// Client for the proxy server at `addr`.
    pub fn new(addr: &str) -> Self {
        HttpTunnelClient {
            addr: addr.to_string(),
        }
    }
}

#[async_trait]
impl ProxyClient for HttpTunnelClient {
    async fn request(&self, addr: &Address) -> ProxyResult<(BoxConn, Address)> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ProxyError::general(Error::Io(e)))?;
        let mut conn = BufReader::new(stream);

        send_connect(&mut conn, addr)
            .await
            .map_err(ProxyError::general)?;
        read_response(&mut conn).await?;

        let bound = Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED, 0);
        Ok((Box::new(HttpTunnelConn { inner: conn }), bound))
    }
}

async fn send_connect<W: AsyncWrite + Unpin>(writer: &mut W, addr: &Address) -> Result<()> {
    let target = addr.to_string();
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\n\
         Host: {target}\r\n\
         Proxy-Connection: keep-alive\r\n\
         User-Agent: {}\r\n\r\n",
        crate::user_agent()
    );
    writer.write_all(request.as_bytes()).await?;
    Ok(())
}

async fn read_response<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> ProxyResult<()> {
    let status = read_line(reader).await.map_err(ProxyError::general)?;
    let mut fields = status.split_whitespace();
    let code = fields
        .nth(1)
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| {
            ProxyError::general(Error::protocol(format!(
                "invalid heading from proxy server: {status}"
            )))
        })?;

    if !(200..300).contains(&code) {
        let kind = match code / 100 {
            4 => ProxyErrorKind::CmdUnsupported,
            5 => ProxyErrorKind::ConnectFailed,
            _ => ProxyErrorKind::GeneralErr,
        };
        return Err(ProxyError::new(
            kind,
            Error::protocol(format!("proxy server responses: {status}")),
        ));
    }

    // drain the remaining headers up to the blank line
    loop {
        let line = read_line(reader).await.map_err(ProxyError::general)?;
        if line.is_empty() {
            return Ok(());
        }
    }
}

async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .take(MAX_LINE as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| Error::protocol(format!("failed to read from proxy server: {e}")))?;
    if n == 0 {
        return Err(Error::protocol("proxy server closed the connection"));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// The raw tunnel after the CONNECT exchange. Reads go through the buffer
/// that may already hold tunnel bytes; writes pass straight through.
struct HttpTunnelConn {
    inner: BufReader<TcpStream>,
}

impl AsyncRead for HttpTunnelConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for HttpTunnelConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Conn for HttpTunnelConn {
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        Ok(Vec::new())
    }

    fn peer_addr_text(&self) -> String {
        self.inner
            .get_ref()
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn fake_proxy(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            // read until the blank line ending the request head
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            // echo one tag through the raw tunnel
            let mut tag = [0u8; 4];
            if stream.read_exact(&mut tag).await.is_ok() {
                let _ = stream.write_all(&tag).await;
            }
            String::from_utf8_lossy(&request).into_owned()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_connect_success_and_raw_stream() {
        let (addr, server) =
            fake_proxy("HTTP/1.1 200 Connection established\r\nX-Padding: yes\r\n\r\n").await;
        let client = HttpTunnelClient::new(&addr);

        let (mut conn, bound) = client
            .request(&Address::Domain("target.example".into(), 443))
            .await
            .unwrap();
        assert_eq!(bound, Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED, 0));

        conn.write_all(b"data").await.unwrap();
        let mut echoed = [0u8; 4];
        conn.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"data");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT target.example:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: target.example:443\r\n"));
        assert!(request.contains("Proxy-Connection: keep-alive\r\n"));
        assert!(request.contains("User-Agent: portcullis/"));
    }

    #[tokio::test]
    async fn test_status_code_mapping() {
        for (status, kind) in [
            ("HTTP/1.1 403 Forbidden\r\n\r\n", ProxyErrorKind::CmdUnsupported),
            (
                "HTTP/1.1 502 Bad Gateway\r\n\r\n",
                ProxyErrorKind::ConnectFailed,
            ),
            (
                "HTTP/1.1 301 Moved Permanently\r\n\r\n",
                ProxyErrorKind::GeneralErr,
            ),
        ] {
            let (addr, _server) = fake_proxy(status).await;
            let client = HttpTunnelClient::new(&addr);
            let err = client
                .request(&Address::Domain("t".into(), 80))
                .await
                .unwrap_err();
            assert_eq!(err.kind, kind, "status {status:?}");
        }
    }

    #[tokio::test]
    async fn test_garbage_status_line() {
        let (addr, _server) = fake_proxy("not-http-at-all\r\n\r\n").await;
        let client = HttpTunnelClient::new(&addr);
        let err = client
            .request(&Address::Domain("t".into(), 80))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxyErrorKind::GeneralErr);
    }
}
