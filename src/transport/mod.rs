//! Transport Stack Implementation.
//!
//! A transport turns an address into a bidirectional byte stream (`dial`)
//! or into a listener producing such streams (`listen`). Transports compose
//! inside-out:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Compression (outermost, flush-on-write)       │
//! ├────────────────────────────────────────────────┤
//! │  TLS (encryption + peer identity)              │
//! ├────────────────────────────────────────────────┤
//! │  TCP  |  KCP over UDP  |  proxied via upstream │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! At most one inner layer is active; KCP and proxied are mutually
//! exclusive. An optional pre-connect wrapper can sit around a fully
//! assembled client-side stack to hand out pre-established connections.

pub mod compress;
pub mod kcp;
pub mod preconn;
pub mod proxied;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::addr::PeerIdentifier;
use crate::config::TransportConfig;
use crate::error::{Error, Result};

/// A bidirectional byte stream with optional capabilities.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Identifiers of the authenticated peer, if the stream carries any.
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        Ok(Vec::new())
    }

    /// Textual form of the transport endpoint of the peer.
    fn peer_addr_text(&self) -> String {
        "unknown".to_string()
    }
}

/// An owned, type-erased connection.
pub type BoxConn = Box<dyn Conn>;

impl std::fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer_addr", &self.peer_addr_text())
            .finish()
    }
}

impl Conn for BoxConn {
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        (**self).peer_identifiers()
    }

    fn peer_addr_text(&self) -> String {
        (**self).peer_addr_text()
    }
}

/// A server-side stream acceptor.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<BoxConn>;

    /// The address the listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Client and server side operations of a stream transport.
///
/// `listen` is unimplemented for client-only transports; calling it on one
/// is a programming error and panics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a connection to the given `host:port` address.
    async fn dial(&self, addr: &str) -> Result<BoxConn>;

    /// Create a listener bound to the given address.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// Plain TCP transport. Accepted sockets get TCP keepalive enabled.
pub struct TcpTransport;

impl Conn for TcpStream {
    fn peer_addr_text(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<BoxConn> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpListenerWrapper { listener }))
    }
}

struct TcpListenerWrapper {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&mut self) -> Result<BoxConn> {
        let (stream, _) = self.listener.accept().await?;
        let sock = socket2::SockRef::from(&stream);
        if let Err(e) = sock.set_keepalive(true) {
            return Err(Error::Io(e));
        }
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Assemble a transport stack from configuration.
///
/// `None` means plain TCP. Layering order and the KCP/proxied exclusion
/// follow the module documentation.
pub fn build_transport(config: Option<&TransportConfig>) -> Result<Arc<dyn Transport>> {
    let cfg = match config {
        None => return Ok(Arc::new(TcpTransport)),
        Some(cfg) => cfg,
    };

    if cfg.kcp.is_some() && cfg.proxied.is_some() {
        return Err(Error::config("'kcp' cannot be used along with 'proxied'"));
    }

    let mut transport: Arc<dyn Transport> = if let Some(kcp_cfg) = &cfg.kcp {
        Arc::new(kcp::KcpTransport::new(kcp_cfg)?)
    } else if let Some(proxied_cfg) = &cfg.proxied {
        Arc::new(proxied::ProxiedTransport::new(proxied_cfg)?)
    } else {
        Arc::new(TcpTransport)
    };

    if let Some(tls_cfg) = &cfg.tls {
        transport = Arc::new(tls::TlsTransport::new(tls_cfg, transport)?);
    }

    if let Some(method) = cfg.compression.as_deref().filter(|m| !m.is_empty()) {
        transport = Arc::new(compress::CompressionTransport::new(transport, method)?);
    }

    if let Some(pre_cfg) = &cfg.pre_conn {
        transport = Arc::new(preconn::PreConnTransport::new(transport, pre_cfg)?);
    }

    Ok(transport)
}
