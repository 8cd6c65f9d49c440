//! Reliable-datagram transport over UDP.
//!
//! A KCP-style stack: ARQ with mode-tuned timers, optional XOR-group FEC,
//! an inner DATA/CLOSE/KEEPALIVE framing for end-of-stream and liveness
//! signalling, and a per-transport keepalive manager that evicts lost
//! connections.

mod arq;
mod fec;
mod frame;
mod keepalive;
mod packet;
mod session;

pub use frame::{ConnClocks, KcpConn};
pub use session::KcpStream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::KcpConfig;
use crate::error::{Error, Result};
use crate::transport::{BoxConn, Listener, Transport};

use arq::ArqConfig;
use keepalive::{KeepaliveHandle, KeepaliveManager};
use session::{KcpSessionListener, SessionConfig};

/// Default FEC shard ratio.
const DEFAULT_FEC_DIST: (usize, usize) = (10, 2);

/// Connection-aware transport based on a KCP-style protocol. Closing a
/// connection notifies the peer end on a best-efforts basis.
pub struct KcpTransport {
    session: SessionConfig,
    manager: Option<Arc<KeepaliveManager>>,
}

impl KcpTransport {
    /// Build a transport from configuration.
    pub fn new(config: &KcpConfig) -> Result<Self> {
        let (nodelay, interval_ms, resend, no_congestion) = match config.mode.as_str() {
            "" | "normal" => (false, 25, 0, false),
            "fast" => (false, 25, 2, true),
            "fast2" => (true, 10, 2, true),
            other => return Err(Error::config(format!("invalid KCP mode: {other}"))),
        };

        let (snd_wnd, rcv_wnd) = match config.optimize.as_str() {
            "" | "balance" => (256, 256),
            "receive" => (128, 512),
            "send" => (512, 128),
            "server" => (1024, 1024),
            other => return Err(Error::config(format!("invalid optimization: {other}"))),
        };

        let fec = if config.fec {
            Some(match &config.fec_dist {
                None => DEFAULT_FEC_DIST,
                Some(dist) => parse_fec_dist(dist)?,
            })
        } else {
            None
        };

        let manager = match (config.keep_alive_interval_ms, config.keep_alive_timeout_ms) {
            (None, None) => None,
            (Some(interval), Some(timeout)) => {
                if interval == 0 || timeout == 0 {
                    return Err(Error::config(
                        "keepalive interval and timeout must be greater than 0",
                    ));
                }
                Some(Arc::new(KeepaliveManager::start(
                    Duration::from_millis(interval),
                    Duration::from_millis(timeout),
                )))
            }
            _ => {
                return Err(Error::config(
                    "'keep_alive_interval_ms' must be used with 'keep_alive_timeout_ms'",
                ));
            }
        };

        Ok(KcpTransport {
            session: SessionConfig {
                arq: ArqConfig {
                    nodelay,
                    resend,
                    no_congestion,
                    snd_wnd,
                    rcv_wnd,
                },
                interval: Duration::from_millis(interval_ms),
                fec,
            },
            manager,
        })
    }

    /// Connections currently supervised by the keepalive manager.
    pub fn keepalive_count(&self) -> usize {
        self.manager.as_ref().map(|m| m.len()).unwrap_or(0)
    }
}

fn parse_fec_dist(dist: &str) -> Result<(usize, usize)> {
    let parts: Vec<&str> = dist.split(',').map(str::trim).collect();
    if parts.len() == 2 {
        if let (Ok(data), Ok(parity)) = (parts[0].parse(), parts[1].parse()) {
            if data > 0 && parity > 0 {
                return Ok((data, parity));
            }
        }
    }
    Err(Error::config(format!("invalid FEC distribution: {dist}")))
}

fn wrap_stream(
    stream: KcpStream,
    manager: Option<&Arc<KeepaliveManager>>,
) -> KcpConn<KcpStream> {
    let clocks = Arc::new(ConnClocks::new());
    if let Some(manager) = manager {
        manager.register(KeepaliveHandle {
            clocks: Arc::clone(&clocks),
            injector: Arc::downgrade(stream.injector()),
            closer: stream.closer(),
        });
    }
    KcpConn::new(stream, clocks)
}

#[async_trait]
impl Transport for KcpTransport {
    async fn dial(&self, addr: &str) -> Result<BoxConn> {
        let stream = session::dial_session(addr, self.session).await?;
        Ok(Box::new(wrap_stream(stream, self.manager.as_ref())))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let inner = KcpSessionListener::bind(addr, self.session).await?;
        Ok(Box::new(KcpListenerWrapper {
            inner,
            manager: self.manager.clone(),
        }))
    }
}

struct KcpListenerWrapper {
    inner: KcpSessionListener,
    manager: Option<Arc<KeepaliveManager>>,
}

#[async_trait]
impl Listener for KcpListenerWrapper {
    async fn accept(&mut self) -> Result<BoxConn> {
        let stream = self.inner.accept_stream().await?;
        Ok(Box::new(wrap_stream(stream, self.manager.as_ref())))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn base_config() -> KcpConfig {
        KcpConfig {
            mode: "fast2".into(),
            optimize: "balance".into(),
            fec: true,
            fec_dist: None,
            keep_alive_interval_ms: None,
            keep_alive_timeout_ms: None,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(KcpTransport::new(&base_config()).is_ok());

        let mut bad_mode = base_config();
        bad_mode.mode = "warp".into();
        assert!(KcpTransport::new(&bad_mode).is_err());

        let mut bad_opt = base_config();
        bad_opt.optimize = "sideways".into();
        assert!(KcpTransport::new(&bad_opt).is_err());

        let mut half_keepalive = base_config();
        half_keepalive.keep_alive_interval_ms = Some(100);
        assert!(KcpTransport::new(&half_keepalive).is_err());

        let mut bad_fec = base_config();
        bad_fec.fec_dist = Some("10".into());
        assert!(KcpTransport::new(&bad_fec).is_err());
        bad_fec.fec_dist = Some("8,3".into());
        assert!(KcpTransport::new(&bad_fec).is_ok());
    }

    #[tokio::test]
    async fn test_dial_listen_echo() {
        let transport = KcpTransport::new(&base_config()).unwrap();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut client = transport.dial(&addr.to_string()).await.unwrap();
        let payload: Vec<u8> = (0..5000).map(|i| (i % 241) as u8).collect();
        client.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        client.shutdown().await.unwrap();
        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    }

    #[tokio::test]
    async fn test_keepalive_survives_slow_reader() {
        let mut config = base_config();
        config.keep_alive_interval_ms = Some(50);
        config.keep_alive_timeout_ms = Some(150);
        let transport = Arc::new(KcpTransport::new(&config).unwrap());

        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            // stall before serving, longer than the keepalive timeout
            tokio::time::sleep(Duration::from_millis(500)).await;
            let mut buf = vec![0u8; 8192];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut client = transport.dial(&addr.to_string()).await.unwrap();
        for round in 0..5u8 {
            let block = vec![round; 1024];
            client.write_all(&block).await.unwrap();
            let mut echoed = vec![0u8; block.len()];
            tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
                .await
                .expect("echo within time")
                .unwrap();
            assert_eq!(echoed, block);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        client.shutdown().await.unwrap();
        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;

        // give the manager a few sweeps to observe the closed clocks
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.keepalive_count(), 0);
    }
}
