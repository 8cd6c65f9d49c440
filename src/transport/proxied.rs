//! Proxied transport: dialing through another proxy hop.
//!
//! A client-only transport whose `dial` resolves the target into an
//! address and asks an embedded proxy client for a tunnel to it. Used to
//! nest transports: a KCP+TLS upstream can itself be reached through a
//! further SOCKS5 or HTTP hop.

use std::sync::Arc;

use async_trait::async_trait;

use crate::addr::Address;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::proxy::{create_proxy_client, ProxyClient};
use crate::transport::{BoxConn, Listener, Transport};

/// Transport that dials via an upstream proxy client.
pub struct ProxiedTransport {
    upstream: Arc<dyn ProxyClient>,
}

impl ProxiedTransport {
    /// Build from the embedded proxy configuration.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let upstream = create_proxy_client(config)
            .map_err(|e| Error::config(format!("proxied transport: {e}")))?;
        Ok(ProxiedTransport { upstream })
    }
}

#[async_trait]
impl Transport for ProxiedTransport {
    async fn dial(&self, addr: &str) -> Result<BoxConn> {
        let target = Address::parse(addr)?;
        let (conn, _bound) = self
            .upstream
            .request(&target)
            .await
            .map_err(|e| Error::protocol(format!("proxied connection failed: {e}")))?;
        Ok(conn)
    }

    async fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>> {
        panic!("ProxiedTransport can not be used as a server-side transport");
    }
}
