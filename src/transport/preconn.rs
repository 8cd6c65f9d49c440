//! Pre-connect pool wrapper.
//!
//! A client-only transport that keeps a per-target ring buffer of already
//! established inner connections and hands them out on `dial`, hiding the
//! connection setup latency of heavy stacks. A starved dial triggers an
//! asynchronous refill to capacity while the caller's request is served by
//! the inner transport directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::PreConnConfig;
use crate::error::{Error, Result};
use crate::transport::{BoxConn, Listener, Transport};

/// Bound on each pre-establishing dial.
const PRECONN_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// The epoch tops pools back up to this size.
const IDLE_POOL_SIZE: usize = 2;

/// Epoch period ceiling.
const MAX_EPOCH_INTERVAL: Duration = Duration::from_secs(30);

/// Epochs per connection lifetime.
const EPOCHS_PER_LIFETIME: u32 = 20;

const DEFAULT_MAX_POOL_SIZE: usize = 5;
const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

struct PooledConn {
    conn: BoxConn,
    established: Instant,
}

/// Ring buffer state. `capacity + 1` slots so empty and full are
/// distinguishable by index equality alone.
struct Ring {
    slots: Vec<Option<PooledConn>>,
    begin: usize,
    next: usize,
}

impl Ring {
    fn size(&self) -> usize {
        (self.next + self.slots.len() - self.begin) % self.slots.len()
    }
}

struct PoolMgr {
    target: String,
    /// Guards the O(1) ring-buffer index operations
    ring: Mutex<Ring>,
    /// Serialises refill attempts
    refill_lock: tokio::sync::Mutex<()>,
}

impl PoolMgr {
    fn new(target: String, capacity: usize) -> Self {
        PoolMgr {
            target,
            ring: Mutex::new(Ring {
                slots: (0..capacity + 1).map(|_| None).collect(),
                begin: 0,
                next: 0,
            }),
            refill_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Pop the oldest pooled connection, if any.
    fn pop(&self) -> Option<PooledConn> {
        let mut ring = self.ring.lock();
        if ring.begin == ring.next {
            return None;
        }
        let begin = ring.begin;
        let conn = ring.slots[begin].take();
        ring.begin = (begin + 1) % ring.slots.len();
        conn
    }

    fn push(&self, conn: PooledConn) {
        let mut ring = self.ring.lock();
        let next = ring.next;
        ring.slots[next] = Some(conn);
        ring.next = (next + 1) % ring.slots.len();
    }

    fn size(&self) -> usize {
        self.ring.lock().size()
    }

    /// Drop connections established before `expire_before`; returns the
    /// remaining size.
    fn evict_older_than(&self, expire_before: Instant) -> usize {
        let mut dropped = Vec::new();
        let size = {
            let mut ring = self.ring.lock();
            while ring.begin != ring.next {
                // entries are ordered by establishment time
                match &ring.slots[ring.begin] {
                    Some(pc) if pc.established <= expire_before => {
                        let begin = ring.begin;
                        dropped.push(ring.slots[begin].take());
                        ring.begin = (begin + 1) % ring.slots.len();
                    }
                    _ => break,
                }
            }
            ring.size()
        };
        if !dropped.is_empty() {
            // closing happens off the lock, asynchronously
            tokio::spawn(async move { drop(dropped) });
        }
        size
    }

    /// Establish connections until the pool holds `expected` entries.
    async fn refill(self: Arc<Self>, transport: Arc<dyn Transport>, expected: usize) {
        let _guard = self.refill_lock.lock().await;
        // only this task pushes, so the ring cannot overflow
        let have = self.size();
        for _ in have..expected {
            let dialed = tokio::time::timeout(
                PRECONN_DIAL_TIMEOUT,
                transport.dial(&self.target),
            )
            .await;
            match dialed {
                Ok(Ok(conn)) => self.push(PooledConn {
                    conn,
                    established: Instant::now(),
                }),
                Ok(Err(e)) => {
                    tracing::debug!("pre-connect to {} failed: {}", self.target, e);
                    break;
                }
                Err(_) => {
                    tracing::debug!("pre-connect to {} timed out", self.target);
                    break;
                }
            }
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    pools: Mutex<HashMap<String, Arc<PoolMgr>>>,
    max_pool_size: usize,
    lifetime: Duration,
}

/// Transport wrapper maintaining warm pools of inner connections.
pub struct PreConnTransport {
    shared: Arc<Shared>,
    epoch_task: tokio::task::JoinHandle<()>,
}

impl PreConnTransport {
    /// Wrap `transport` with per-target warm pools.
    pub fn new(transport: Arc<dyn Transport>, config: &PreConnConfig) -> Result<Self> {
        let max_pool_size = match config.max_pool_size {
            None => DEFAULT_MAX_POOL_SIZE,
            Some(0) => return Err(Error::config("max_pool_size must be greater than 0")),
            Some(n) => n,
        };
        let lifetime = match config.lifetime_secs {
            None => DEFAULT_LIFETIME,
            Some(0) => return Err(Error::config("pre_conn lifetime must be > 0")),
            Some(secs) => Duration::from_secs(secs),
        };

        let shared = Arc::new(Shared {
            transport,
            pools: Mutex::new(HashMap::new()),
            max_pool_size,
            lifetime,
        });

        let epoch_interval = (lifetime / EPOCHS_PER_LIFETIME).min(MAX_EPOCH_INTERVAL);
        let epoch_shared = Arc::clone(&shared);
        let epoch_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(epoch_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                run_epoch(&epoch_shared);
            }
        });

        Ok(PreConnTransport { shared, epoch_task })
    }

    fn pool_for(&self, target: &str) -> Arc<PoolMgr> {
        let mut pools = self.shared.pools.lock();
        Arc::clone(pools.entry(target.to_string()).or_insert_with(|| {
            Arc::new(PoolMgr::new(
                target.to_string(),
                self.shared.max_pool_size,
            ))
        }))
    }
}

fn run_epoch(shared: &Arc<Shared>) {
    let pools: Vec<Arc<PoolMgr>> = shared.pools.lock().values().cloned().collect();
    let expire_before = Instant::now() - shared.lifetime;
    for pool in pools {
        let size = pool.evict_older_than(expire_before);
        if size < IDLE_POOL_SIZE && size < shared.max_pool_size {
            tokio::spawn(
                pool.refill(
                    Arc::clone(&shared.transport),
                    IDLE_POOL_SIZE.min(shared.max_pool_size),
                ),
            );
        }
    }
}

impl Drop for PreConnTransport {
    fn drop(&mut self) {
        self.epoch_task.abort();
    }
}

#[async_trait]
impl Transport for PreConnTransport {
    async fn dial(&self, addr: &str) -> Result<BoxConn> {
        let pool = self.pool_for(addr);
        if let Some(pooled) = pool.pop() {
            return Ok(pooled.conn);
        }
        // starved: refill in the background, serve this request directly
        tokio::spawn(
            Arc::clone(&pool).refill(
                Arc::clone(&self.shared.transport),
                self.shared.max_pool_size,
            ),
        );
        self.shared.transport.dial(addr).await
    }

    async fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>> {
        panic!("PreConnTransport is a client-only transport");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Conn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Inner transport producing in-memory conns and counting dials.
    struct FakeTransport {
        dials: AtomicUsize,
    }

    struct FakeConn {
        _keep: tokio::io::DuplexStream,
        id: usize,
    }

    impl Conn for FakeConn {
        fn peer_addr_text(&self) -> String {
            format!("fake-{}", self.id)
        }
    }

    impl tokio::io::AsyncRead for FakeConn {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self._keep).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for FakeConn {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self._keep).poll_write(cx, buf)
        }
        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self._keep).poll_flush(cx)
        }
        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self._keep).poll_shutdown(cx)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn dial(&self, _addr: &str) -> Result<BoxConn> {
            let id = self.dials.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(FakeConn { _keep: a, id }))
        }

        async fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>> {
            unreachable!("not used in tests")
        }
    }

    fn wrapper(max_pool_size: usize) -> PreConnTransport {
        PreConnTransport::new(
            Arc::new(FakeTransport {
                dials: AtomicUsize::new(0),
            }),
            &PreConnConfig {
                max_pool_size: Some(max_pool_size),
                lifetime_secs: Some(600),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_starved_dial_delegates_and_refills() {
        let transport = wrapper(3);
        let conn = transport.dial("target:1").await.unwrap();
        assert_eq!(conn.peer_addr_text(), "fake-0");

        // background refill brings the pool to capacity
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pool = transport.pool_for("target:1");
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn test_pool_size_never_exceeds_capacity() {
        let transport = wrapper(3);
        let _ = transport.dial("target:1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // several starved dials in a row must not overfill the ring
        for _ in 0..5 {
            let _ = transport.dial("target:1").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.pool_for("target:1").size() <= 3);
    }

    #[tokio::test]
    async fn test_conns_handed_out_once() {
        let transport = wrapper(4);
        let _ = transport.dial("target:1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let conn = transport.dial("target:1").await.unwrap();
            assert!(
                seen.insert(conn.peer_addr_text()),
                "a pooled conn was handed out twice"
            );
        }
    }

    #[tokio::test]
    async fn test_epoch_drops_expired_and_refills() {
        let transport = wrapper(4);
        let pool = transport.pool_for("t:1");
        // a pool with two ancient connections
        for _ in 0..2 {
            let conn = transport.shared.transport.dial("t:1").await.unwrap();
            pool.push(PooledConn {
                conn,
                established: Instant::now() - Duration::from_secs(3600),
            });
        }
        assert_eq!(pool.size(), 2);

        run_epoch(&transport.shared);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // expired conns are gone and the idle floor is restored
        assert_eq!(pool.size(), IDLE_POOL_SIZE);
    }

    #[tokio::test]
    #[should_panic(expected = "client-only")]
    async fn test_listen_panics() {
        let transport = wrapper(1);
        let _ = transport.listen("127.0.0.1:0").await;
    }
}
