//! Keepalive manager.
//!
//! One background task per transport walks the live connections every
//! quarter interval. Closed connections are dropped from the list, blocked
//! readers past the timeout are presumed lost and torn down, and idle
//! connections get a keepalive probe.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{ConnClocks, FRAME_KEEPALIVE};

/// A registered connection as the manager sees it.
pub(super) struct KeepaliveHandle {
    pub clocks: Arc<ConnClocks>,
    /// Raw-byte injector into the session; dead when the stream is dropped
    pub injector: std::sync::Weak<mpsc::Sender<Bytes>>,
    /// Hard-stops the session driver
    pub closer: CancellationToken,
}

pub(super) struct KeepaliveManager {
    conns: Arc<Mutex<Vec<KeepaliveHandle>>>,
    task: tokio::task::JoinHandle<()>,
}

/// Aborts the process when the owning task unwinds. Losing the keepalive
/// manager silently would leave every connection unsupervised.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            eprintln!("KCP keepalive manager crashed, aborting");
            std::process::abort();
        }
    }
}

impl KeepaliveManager {
    pub(super) fn start(interval: Duration, timeout: Duration) -> Self {
        let conns: Arc<Mutex<Vec<KeepaliveHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let list = Arc::clone(&conns);
        let task = tokio::spawn(async move {
            let _guard = AbortOnPanic;
            let mut tick = tokio::time::interval(interval / 4);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let interval_ns = interval.as_nanos() as i64;
            let timeout_ns = timeout.as_nanos() as i64;
            loop {
                tick.tick().await;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                sweep(&list, now, interval_ns, timeout_ns);
            }
        });
        KeepaliveManager { conns, task }
    }

    pub(super) fn register(&self, handle: KeepaliveHandle) {
        self.conns.lock().push(handle);
    }

    /// Number of connections currently supervised.
    pub(super) fn len(&self) -> usize {
        self.conns.lock().len()
    }
}

impl Drop for KeepaliveManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn sweep(
    list: &Mutex<Vec<KeepaliveHandle>>,
    now: i64,
    interval_ns: i64,
    timeout_ns: i64,
) {
    list.lock().retain(|handle| {
        let last_send = handle.clocks.last_send_ns();
        if last_send == 0 {
            return false; // closed
        }
        let injector = match handle.injector.upgrade() {
            Some(tx) => tx,
            None => return false, // stream dropped without a close
        };
        let block_start = handle.clocks.last_block_start_ns();
        if block_start > 0 && now - block_start > timeout_ns {
            // reader blocked past the timeout: presumed lost
            handle.clocks.mark_closed();
            handle.closer.cancel();
            return false;
        }
        if now - last_send > interval_ns {
            handle.clocks.mark_send();
            tokio::spawn(async move {
                let _ = injector.send(Bytes::from_static(&[FRAME_KEEPALIVE])).await;
            });
        }
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(
        clocks: Arc<ConnClocks>,
        tx: &Arc<mpsc::Sender<Bytes>>,
    ) -> KeepaliveHandle {
        KeepaliveHandle {
            clocks,
            injector: Arc::downgrade(tx),
            closer: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_closed_conns_are_swept() {
        let (tx, _rx) = mpsc::channel::<Bytes>(4);
        let tx = Arc::new(tx);
        let clocks = Arc::new(ConnClocks::new());
        let list = Mutex::new(vec![handle(Arc::clone(&clocks), &tx)]);

        clocks.mark_closed();
        sweep(&list, 1_000_000, 1_000, 1_000);
        assert!(list.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_conn_gets_probe() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        let tx = Arc::new(tx);
        let clocks = Arc::new(ConnClocks::new());
        let list = Mutex::new(vec![handle(Arc::clone(&clocks), &tx)]);

        let now = clocks.last_send_ns() + 10_000_000;
        sweep(&list, now, 1_000_000, 1_000_000_000);
        assert_eq!(list.lock().len(), 1);

        let probe = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(probe.as_ref(), &[FRAME_KEEPALIVE]);
        // the probe refreshed the send clock
        assert!(clocks.last_send_ns() >= now - 10_000_000);
    }

    #[tokio::test]
    async fn test_blocked_reader_is_torn_down() {
        let (tx, _rx) = mpsc::channel::<Bytes>(4);
        let tx = Arc::new(tx);
        let clocks = Arc::new(ConnClocks::new());
        let h = handle(Arc::clone(&clocks), &tx);
        let closer = h.closer.clone();
        let list = Mutex::new(vec![h]);

        let now = clocks.last_send_ns();
        clocks.force_block_start(now - 200_000_000); // blocked for 200ms
        sweep(&list, now, 50_000_000, 150_000_000);

        assert!(list.lock().is_empty());
        assert!(closer.is_cancelled());
        assert_eq!(clocks.last_send_ns(), 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_swept() {
        let (tx, _rx) = mpsc::channel::<Bytes>(4);
        let tx = Arc::new(tx);
        let clocks = Arc::new(ConnClocks::new());
        let list = Mutex::new(vec![handle(Arc::clone(&clocks), &tx)]);

        drop(tx); // the stream owning the injector is gone
        sweep(&list, clocks.last_send_ns(), 1_000_000_000, 1_000_000_000);
        assert!(list.lock().is_empty());
    }
}
