//! Proxy protocol surface.
//!
//! Downstream servers produce [`ProxyRequest`] values; upstream clients
//! turn a target address into an open tunnel. The dispatcher in
//! [`crate::app`] connects the two.

pub mod http;
pub mod socks5;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::addr::{Address, PeerIdentifier};
use crate::config::ProxyConfig;
use crate::error::{Error, ProxyError, ProxyErrorKind, ProxyResult, Result};
use crate::transport::BoxConn;

/// User/password check callback. The user database itself is an external
/// collaborator; servers only ever see this function.
pub type CheckUser = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// A client request accepted by a downstream server.
///
/// `success` and `fail` consume the request, so each can be called at most
/// once and they are mutually exclusive.
#[async_trait]
pub trait ProxyRequest: Send {
    /// Where the client asks to go.
    fn target_addr(&self) -> &Address;

    /// Textual identity of the client's transport endpoint.
    fn peer_addr(&self) -> String;

    /// Identifiers of the authenticated client.
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>>;

    /// Globally unique monotonic request id.
    fn id(&self) -> &str;

    /// Confirm success and hand back the client-side byte stream.
    async fn success(self: Box<Self>, bound: Address) -> BoxConn;

    /// Refuse the request and close the client connection.
    async fn fail(self: Box<Self>, kind: ProxyErrorKind);
}

/// A downstream proxy server.
#[async_trait]
pub trait ProxyServer: Send {
    /// Bind and start accepting; returns the stream of client requests.
    async fn start(&mut self) -> Result<mpsc::Receiver<Box<dyn ProxyRequest>>>;

    /// Stop accepting and release the listener.
    fn stop(&mut self);
}

/// An upstream proxy client.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Open a tunnel to `addr`. Returns the upstream byte stream and the
    /// address the far end bound for this tunnel.
    async fn request(&self, addr: &Address) -> ProxyResult<(BoxConn, Address)>;
}

/// Generator of request identifiers: an atomic counter seeded from the
/// wall clock, rendered as upper-case base-36.
pub struct RequestIds {
    counter: AtomicU64,
}

impl RequestIds {
    /// A generator seeded from the current time.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        RequestIds {
            counter: AtomicU64::new(seed),
        }
    }

    /// Produce the next id.
    pub fn next_id(&self) -> String {
        let mut n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut digits = Vec::with_capacity(13);
        while n > 0 {
            let d = (n % 36) as u8;
            digits.push(if d < 10 { b'0' + d } else { b'A' + d - 10 });
            n /= 36;
        }
        digits.reverse();
        String::from_utf8(digits).expect("base36 digits are ascii")
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        RequestIds::new()
    }
}

/// A `ProxyClient` without any proxy protocol: it dials the target
/// directly over TCP.
pub struct DirectTcpClient;

#[async_trait]
impl ProxyClient for DirectTcpClient {
    async fn request(&self, addr: &Address) -> ProxyResult<(BoxConn, Address)> {
        let stream = TcpStream::connect(addr.to_string())
            .await
            .map_err(|e| ProxyError::connect_failed(Error::Io(e)))?;
        let bound = stream
            .local_addr()
            .map(Address::from)
            .map_err(|e| ProxyError::connect_failed(Error::Io(e)))?;
        Ok((Box::new(stream), bound))
    }
}

/// Create a downstream server from configuration.
pub fn create_proxy_server(
    name: &str,
    config: &ProxyConfig,
    ids: Arc<RequestIds>,
    check_user: Option<CheckUser>,
) -> Result<Box<dyn ProxyServer>> {
    match config.protocol.as_str() {
        "socks5" => Ok(Box::new(socks5::Socks5Server::new(
            name, config, ids, check_user,
        )?)),
        "direct" => Err(Error::config("'direct' cannot be used as a proxy server")),
        "http" => Err(Error::config("'http' cannot be used as a proxy server")),
        other => Err(Error::config(format!("unknown proxy protocol: {other}"))),
    }
}

/// Create an upstream client from configuration.
pub fn create_proxy_client(config: &ProxyConfig) -> Result<Arc<dyn ProxyClient>> {
    match config.protocol.as_str() {
        "direct" => {
            if config.transport.is_some() {
                return Err(Error::config(
                    "'direct' protocol should not have any transport setting",
                ));
            }
            if config.address.is_some() {
                return Err(Error::config(
                    "'direct' protocol should not have an address",
                ));
            }
            Ok(Arc::new(DirectTcpClient))
        }
        "http" => {
            if config.transport.is_some() {
                return Err(Error::config(
                    "'http' protocol should not have any transport setting",
                ));
            }
            let addr = config
                .address
                .as_deref()
                .ok_or_else(|| Error::config("'http' protocol requires an 'address'"))?;
            Ok(Arc::new(http::HttpTunnelClient::new(addr)))
        }
        "socks5" => Ok(Arc::new(socks5::Socks5Client::new(config)?)),
        other => Err(Error::config(format!("unknown proxy protocol: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_monotonic_and_base36() {
        let ids = RequestIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        // same length ids compare in generation order
        assert!(b > a);
    }

    #[test]
    fn test_direct_rejects_transport() {
        let config = ProxyConfig {
            protocol: "direct".into(),
            transport: Some(Default::default()),
            ..Default::default()
        };
        assert!(create_proxy_client(&config).is_err());
    }

    #[test]
    fn test_http_requires_address() {
        let config = ProxyConfig {
            protocol: "http".into(),
            ..Default::default()
        };
        assert!(create_proxy_client(&config).is_err());
    }

    #[test]
    fn test_unknown_protocol() {
        let config = ProxyConfig {
            protocol: "carrier-pigeon".into(),
            ..Default::default()
        };
        assert!(create_proxy_client(&config).is_err());
    }

    #[tokio::test]
    async fn test_direct_client_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let client = DirectTcpClient;
        let (conn, bound) = client.request(&addr).await.unwrap();
        assert!(bound.port() != 0);
        drop(conn);
    }

    #[tokio::test]
    async fn test_direct_client_reports_connect_failed() {
        let client = DirectTcpClient;
        let addr = Address::Domain("does.not.exist.invalid".into(), 80);
        let err = client.request(&addr).await.unwrap_err();
        assert_eq!(err.kind, ProxyErrorKind::ConnectFailed);
    }
}
