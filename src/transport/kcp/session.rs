//! UDP session driver.
//!
//! Each session runs one driver task owning the ARQ and FEC state. User
//! bytes flow in and out through channels; [`KcpStream`] adapts those
//! channels to `AsyncRead`/`AsyncWrite`.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

use super::arq::{ArqConfig, ArqState};
use super::fec::{FecDecoder, FecEncoder};
use super::packet::{Packet, PacketType, MSS};
use crate::error::{Error, Result};
use crate::transport::Conn;

/// Bound on queued-but-unsent outgoing segments.
const SEND_QUEUE_LIMIT: usize = 1024;

/// How long a closing session keeps retransmitting before giving up.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Datagrams cached for FEC recovery.
const FEC_CACHE: usize = 512;

/// Parameters of one session.
#[derive(Debug, Clone, Copy)]
pub(super) struct SessionConfig {
    pub arq: ArqConfig,
    /// Flush tick driving retransmissions
    pub interval: Duration,
    /// `(data_shards, parity_shards)` when FEC is enabled
    pub fec: Option<(usize, usize)>,
}

/// Where the session's datagrams come from and go to. Split into a send
/// sink and a receive source so the driver can await one while using the
/// other.
pub(super) struct SessionIo {
    sink: SendSink,
    source: RecvSource,
}

enum SendSink {
    Client(Arc<UdpSocket>),
    Server { socket: Arc<UdpSocket>, peer: SocketAddr },
}

enum RecvSource {
    Client(Arc<UdpSocket>),
    Server(mpsc::Receiver<Bytes>),
}

impl SessionIo {
    pub(super) fn client(socket: Arc<UdpSocket>) -> Self {
        SessionIo {
            sink: SendSink::Client(Arc::clone(&socket)),
            source: RecvSource::Client(socket),
        }
    }

    pub(super) fn server(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        SessionIo {
            sink: SendSink::Server { socket, peer },
            source: RecvSource::Server(rx),
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        match &self.sink {
            SendSink::Client(socket) => socket.peer_addr().ok(),
            SendSink::Server { peer, .. } => Some(*peer),
        }
    }
}

impl SendSink {
    async fn send(&self, data: &[u8]) {
        let result = match self {
            SendSink::Client(socket) => socket.send(data).await,
            SendSink::Server { socket, peer } => socket.send_to(data, *peer).await,
        };
        if let Err(e) = result {
            tracing::debug!("udp send failed: {}", e);
        }
    }
}

impl RecvSource {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        match self {
            RecvSource::Client(socket) => {
                let mut buf = [0u8; 2048];
                let n = socket.recv(&mut buf).await?;
                Ok(Some(Bytes::copy_from_slice(&buf[..n])))
            }
            RecvSource::Server(rx) => Ok(rx.recv().await),
        }
    }
}

/// Start a session driver and return the stream endpoint for it.
pub(super) fn spawn_session(io: SessionIo, config: SessionConfig) -> KcpStream {
    let peer = io.peer();
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(64);
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(64);
    let closer = CancellationToken::new();

    tokio::spawn(drive(io, config, out_rx, in_tx, closer.clone()));

    KcpStream {
        tx: PollSender::new(out_tx.clone()),
        injector: Arc::new(out_tx),
        rx: in_rx,
        leftover: Bytes::new(),
        peer,
        closer,
        shutdown_sent: false,
    }
}

async fn drive(
    io: SessionIo,
    config: SessionConfig,
    mut out_rx: mpsc::Receiver<Bytes>,
    in_tx: mpsc::Sender<Bytes>,
    closer: CancellationToken,
) {
    let SessionIo {
        sink,
        mut source,
    } = io;
    let mut arq = ArqState::new(config.arq);
    let mut fec_enc = config.fec.map(|(d, p)| FecEncoder::new(d, p));
    let mut fec_dec = config.fec.map(|_| FecDecoder::new(FEC_CACHE));
    let mut send_queue: VecDeque<Bytes> = VecDeque::new();
    let mut tick = tokio::time::interval(config.interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut closing = false;
    let mut close_deadline = None;
    let mut ack_due = false;
    let mut recv_errors = 0u32;

    loop {
        // push queued segments into flight
        while arq.can_send() && !send_queue.is_empty() {
            let chunk = send_queue.pop_front().expect("checked non-empty");
            let seq = arq.on_send(chunk.clone());
            let datagram = Packet::data(seq, chunk).encode();
            sink.send(&datagram).await;
            if let Some(enc) = &mut fec_enc {
                for repair in enc.push(seq, datagram.clone()) {
                    sink.send(&repair.encode()).await;
                }
            }
        }

        if ack_due {
            sink.send(&arq.make_ack().encode()).await;
            ack_due = false;
        }

        if closing {
            let drained = arq.in_flight() == 0 && send_queue.is_empty();
            let expired = close_deadline.is_some_and(|d| Instant::now() >= d);
            if drained || expired {
                sink.send(&Packet::fin(0).encode()).await;
                return;
            }
        }

        tokio::select! {
            _ = closer.cancelled() => return,
            _ = tick.tick() => {
                for (seq, payload) in arq.retransmissions() {
                    sink.send(&Packet::data(seq, payload).encode()).await;
                }
            }
            msg = out_rx.recv(), if !closing && send_queue.len() < SEND_QUEUE_LIMIT => {
                match msg {
                    Some(b) if b.is_empty() => {
                        // shutdown sentinel
                        closing = true;
                        close_deadline = Some(Instant::now() + CLOSE_LINGER);
                    }
                    Some(mut b) => {
                        while !b.is_empty() {
                            let n = b.len().min(MSS);
                            send_queue.push_back(b.split_to(n));
                        }
                    }
                    None => {
                        // every endpoint handle dropped
                        closing = true;
                        close_deadline = Some(Instant::now() + CLOSE_LINGER);
                    }
                }
            }
            datagram = source.recv() => {
                match datagram {
                    Ok(Some(d)) => {
                        recv_errors = 0;
                        match handle_datagram(&d, &mut arq, &mut fec_dec, &in_tx).await {
                            Ok(Flow::Continue(acked)) => ack_due |= acked,
                            Ok(Flow::PeerClosed) => return,
                            Err(e) => {
                                // stray or corrupt datagram; the ARQ layer
                                // shrugs it off
                                tracing::debug!("undecodable datagram: {}", e);
                            }
                        }
                    }
                    Ok(None) => return, // demultiplexer is gone
                    Err(e) => {
                        recv_errors += 1;
                        tracing::debug!("udp recv failed: {}", e);
                        if recv_errors > 16 {
                            return;
                        }
                    }
                }
            }
        }
    }
}

enum Flow {
    /// Keep going; `true` when an ack should be emitted
    Continue(bool),
    PeerClosed,
}

async fn handle_datagram(
    datagram: &Bytes,
    arq: &mut ArqState,
    fec_dec: &mut Option<FecDecoder>,
    in_tx: &mpsc::Sender<Bytes>,
) -> Result<Flow> {
    let packet = Packet::decode(datagram)?;
    match packet.packet_type {
        PacketType::Data => {
            if let Some(dec) = fec_dec {
                dec.saw_data(packet.seq, datagram.clone());
            }
            deliver(arq, in_tx, packet.seq, packet.payload).await;
            Ok(Flow::Continue(true))
        }
        PacketType::Ack => {
            let ooo = packet.ack_list()?;
            arq.on_ack(packet.ack, &ooo);
            Ok(Flow::Continue(false))
        }
        PacketType::Fec => {
            if let Some(dec) = fec_dec {
                if let Some((_, recovered)) = dec.on_repair(&packet) {
                    let inner = Packet::decode(&recovered)?;
                    if inner.packet_type == PacketType::Data {
                        deliver(arq, in_tx, inner.seq, inner.payload).await;
                        return Ok(Flow::Continue(true));
                    }
                }
            }
            Ok(Flow::Continue(false))
        }
        PacketType::Fin => Ok(Flow::PeerClosed),
    }
}

async fn deliver(arq: &mut ArqState, in_tx: &mpsc::Sender<Bytes>, seq: u64, payload: Bytes) {
    for ordered in arq.on_data(seq, payload) {
        // reader side may already be gone; keep draining so acks flow
        let _ = in_tx.send(ordered).await;
    }
}

/// One end of an established KCP session.
pub struct KcpStream {
    tx: PollSender<Bytes>,
    injector: Arc<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    peer: Option<SocketAddr>,
    closer: CancellationToken,
    shutdown_sent: bool,
}

impl KcpStream {
    /// A sender that can inject raw stream bytes, used for keepalives.
    pub(super) fn injector(&self) -> &Arc<mpsc::Sender<Bytes>> {
        &self.injector
    }

    /// Token that hard-stops the session driver when cancelled.
    pub(super) fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// The remote endpoint.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl AsyncRead for KcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(b)) => self.leftover = b,
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for KcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let item = Bytes::copy_from_slice(buf);
                match self.tx.send_item(item) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        if self.shutdown_sent {
            return Poll::Ready(Ok(()));
        }
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                // an empty chunk tells the driver to drain and send FIN
                let _ = self.tx.send_item(Bytes::new());
                self.shutdown_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.shutdown_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Conn for KcpStream {
    fn peer_addr_text(&self) -> String {
        self.peer
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Dial a session to a remote listener.
pub(super) async fn dial_session(addr: &str, config: SessionConfig) -> Result<KcpStream> {
    let target = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::addr(format!("cannot resolve: {addr}")))?;
    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().expect("static address")
    } else {
        "[::]:0".parse().expect("static address")
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(target).await?;
    Ok(spawn_session(SessionIo::client(Arc::new(socket)), config))
}

/// A bound KCP listener demultiplexing sessions by peer address.
pub struct KcpSessionListener {
    local: SocketAddr,
    accept_rx: mpsc::Receiver<KcpStream>,
    demux: tokio::task::JoinHandle<()>,
}

impl KcpSessionListener {
    pub(super) async fn bind(addr: &str, config: SessionConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let demux = tokio::spawn(demux_loop(socket, config, accept_tx));
        Ok(KcpSessionListener {
            local,
            accept_rx,
            demux,
        })
    }

    pub(super) async fn accept_stream(&mut self) -> Result<KcpStream> {
        self.accept_rx.recv().await.ok_or(Error::Closed)
    }

    pub(super) fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for KcpSessionListener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    config: SessionConfig,
    accept_tx: mpsc::Sender<KcpStream>,
) {
    let mut sessions: std::collections::HashMap<SocketAddr, mpsc::Sender<Bytes>> =
        std::collections::HashMap::new();
    let mut buf = [0u8; 2048];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("udp recv_from failed: {}", e);
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        match sessions.get(&peer) {
            Some(tx) => {
                if tx.send(datagram).await.is_err() {
                    sessions.remove(&peer);
                }
            }
            None => {
                // only payload-bearing packets may open a session; stray
                // acks or fins from dead sessions are dropped
                let opens = matches!(
                    datagram.first(),
                    Some(&t) if t == PacketType::Data as u8 || t == PacketType::Fec as u8
                );
                if !opens {
                    continue;
                }
                let (gram_tx, gram_rx) = mpsc::channel::<Bytes>(256);
                let _ = gram_tx.send(datagram).await;
                sessions.insert(peer, gram_tx);
                let stream = spawn_session(
                    SessionIo::server(Arc::clone(&socket), peer, gram_rx),
                    config,
                );
                if accept_tx.send(stream).await.is_err() {
                    return; // listener dropped
                }
            }
        }
    }
}
