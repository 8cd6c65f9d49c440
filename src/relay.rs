//! Bidirectional relay engine.
//!
//! Two half-duplex pumps copy bytes between the downstream and upstream
//! streams. They share a cancellation token: when one direction ends
//! (end-of-stream, error, or cancellation) the token fires so the sibling
//! is never left blocked forever. Once both pumps have returned, both
//! streams are closed; close errors are logged and discarded. An in-flight
//! write on the sibling still completes before its pump observes the
//! token, so the last buffered chunk is not cut off mid-transfer.

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::bufpool;
use crate::transport::BoxConn;
use crate::RELAY_BUFFER_SIZE;

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// The source reached end-of-stream
    Eof,
    /// The sibling direction ended first
    Cancelled,
    /// Read or write error
    Error,
}

type PumpResult = (u64, PumpEnd, WriteHalf<BoxConn>);

/// Relay bytes between the two streams until both directions are done,
/// then close both.
///
/// `token` is the request-scope token: cancelling it from outside tears
/// the tunnel down.
pub async fn relay(
    req_id: &str,
    downstream: BoxConn,
    upstream: BoxConn,
    token: CancellationToken,
) {
    let (down_read, down_write) = tokio::io::split(downstream);
    let (up_read, up_write) = tokio::io::split(upstream);

    let upward = tokio::spawn(pump(down_read, up_write, token.clone()));
    let downward = tokio::spawn(pump(up_read, down_write, token.clone()));
    let (upward, downward) = tokio::join!(upward, downward);

    let up_write = finish(req_id, "downstream", upward);
    let down_write = finish(req_id, "upstream", downward);

    for (side, write_half) in [("upstream", up_write), ("downstream", down_write)] {
        if let Some(mut write_half) = write_half {
            if let Err(e) = write_half.shutdown().await {
                tracing::warn!("[{}] error occurred when closing {}: {}", req_id, side, e);
            }
        }
    }
}

async fn pump(
    mut src: ReadHalf<BoxConn>,
    mut dst: WriteHalf<BoxConn>,
    token: CancellationToken,
) -> PumpResult {
    let mut buf = bufpool::get(RELAY_BUFFER_SIZE);
    let mut transferred = 0u64;

    let end = loop {
        let read = tokio::select! {
            _ = token.cancelled() => break PumpEnd::Cancelled,
            read = src.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break PumpEnd::Eof,
            Ok(n) => match dst.write_all(&buf[..n]).await {
                Ok(()) => transferred += n as u64,
                Err(e) => {
                    tracing::debug!("relay write failed: {}", e);
                    break PumpEnd::Error;
                }
            },
            Err(e) => {
                tracing::debug!("relay read failed: {}", e);
                break PumpEnd::Error;
            }
        }
    };

    // wake the sibling regardless of why this direction ended
    token.cancel();
    (transferred, end, dst)
}

/// Log one pump's outcome and recover its write half.
fn finish(
    req_id: &str,
    src_name: &str,
    result: std::result::Result<PumpResult, tokio::task::JoinError>,
) -> Option<WriteHalf<BoxConn>> {
    match result {
        Ok((bytes, PumpEnd::Eof, dst)) => {
            tracing::info!(
                "[{}] connection closed by {}, {} bytes transferred",
                req_id,
                src_name,
                bytes
            );
            Some(dst)
        }
        Ok((bytes, PumpEnd::Cancelled, dst)) => {
            tracing::info!(
                "[{}] relay from {} ended, {} bytes transferred",
                req_id,
                src_name,
                bytes
            );
            Some(dst)
        }
        Ok((bytes, PumpEnd::Error, dst)) => {
            tracing::warn!(
                "[{}] relay from {} failed, {} bytes transferred",
                req_id,
                src_name,
                bytes
            );
            Some(dst)
        }
        Err(e) => {
            tracing::warn!("[{}] relay task for {} panicked: {}", req_id, src_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Conn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    impl Conn for tokio::io::DuplexStream {}

    fn boxed_pair() -> (BoxConn, BoxConn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (down_inner, down_outer) = boxed_pair();
        let (up_inner, up_outer) = boxed_pair();

        let relay_task = tokio::spawn(async move {
            relay("T1", down_inner, up_inner, CancellationToken::new()).await;
        });

        let mut client = down_outer;
        let mut target = up_outer;

        client.write_all(b"question").await.unwrap();
        let mut buf = [0u8; 8];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"question");

        target.write_all(b"answer!!").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"answer!!");

        drop(client);
        drop(target);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_conserves_bytes() {
        let (down_inner, down_outer) = boxed_pair();
        let (up_inner, up_outer) = boxed_pair();

        let relay_task = tokio::spawn(async move {
            relay("T2", down_inner, up_inner, CancellationToken::new()).await;
        });

        let payload: Vec<u8> = (0..200_000).map(|i| (i % 249) as u8).collect();
        let expected = payload.clone();

        let mut client = down_outer;
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut target = up_outer;
        let mut received = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = target.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if received.len() == expected.len() {
                break;
            }
        }
        assert_eq!(received, expected);

        drop(target);
        let _ = writer.await.unwrap();
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_external_cancellation_tears_down() {
        let (down_inner, down_outer) = boxed_pair();
        let (up_inner, up_outer) = boxed_pair();
        let token = CancellationToken::new();

        let relay_token = token.clone();
        let relay_task = tokio::spawn(async move {
            relay("T3", down_inner, up_inner, relay_token).await;
        });

        // idle tunnel, then an external cancel
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), relay_task)
            .await
            .expect("relay should end after cancellation")
            .unwrap();

        drop(down_outer);
        drop(up_outer);
    }
}
