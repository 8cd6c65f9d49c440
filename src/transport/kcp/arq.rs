//! Reliability core: retransmission, ordering and windowing.
//!
//! Tracks unacknowledged segments with RTT-driven retransmission timeouts,
//! reassembles out-of-order receipts, counts duplicate-style acks for fast
//! retransmit, and enforces the send window (optionally tightened by a
//! slow-start congestion window).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::packet::Packet;

/// Initial RTT estimate.
const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Hard ceiling on the retransmission timeout.
const MAX_RTO: Duration = Duration::from_secs(60);

/// Parameters derived from the transport mode and optimize tuples.
#[derive(Debug, Clone, Copy)]
pub struct ArqConfig {
    /// Aggressive timers: smaller RTO floor, gentler RTO backoff
    pub nodelay: bool,
    /// Fast-retransmit after this many later acks; 0 disables
    pub resend: u32,
    /// Disable the congestion window
    pub no_congestion: bool,
    /// Send window in segments
    pub snd_wnd: usize,
    /// Receive window in segments
    pub rcv_wnd: usize,
}

struct PendingSegment {
    payload: Bytes,
    sent_at: Instant,
    rto: Duration,
    retries: u32,
    /// Number of acks seen for later segments while this one was missing
    fast_acks: u32,
}

/// Sender + receiver reliability state for one session.
pub struct ArqState {
    config: ArqConfig,

    // send side
    next_seq: u64,
    pending: BTreeMap<u64, PendingSegment>,
    cwnd: usize,

    // receive side
    rcv_next: u64,
    reorder: BTreeMap<u64, Bytes>,

    // RTT estimation (Jacobson)
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
}

impl ArqState {
    pub fn new(config: ArqConfig) -> Self {
        ArqState {
            config,
            next_seq: 0,
            pending: BTreeMap::new(),
            cwnd: 2,
            rcv_next: 0,
            reorder: BTreeMap::new(),
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTT * 3,
        }
    }

    fn min_rto(&self) -> Duration {
        if self.config.nodelay {
            Duration::from_millis(30)
        } else {
            Duration::from_millis(100)
        }
    }

    /// Effective send window.
    fn window(&self) -> usize {
        if self.config.no_congestion {
            self.config.snd_wnd
        } else {
            self.config.snd_wnd.min(self.cwnd)
        }
    }

    /// Whether another segment may enter flight.
    pub fn can_send(&self) -> bool {
        self.pending.len() < self.window()
    }

    /// Number of in-flight segments.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Register an outgoing payload, assigning its sequence number.
    pub fn on_send(&mut self, payload: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            PendingSegment {
                payload,
                sent_at: Instant::now(),
                rto: self.rto,
                retries: 0,
                fast_acks: 0,
            },
        );
        seq
    }

    /// Process an acknowledgment. `cumulative` counts contiguously received
    /// segments; `ooo` lists receipts above that point.
    pub fn on_ack(&mut self, cumulative: u64, ooo: &[u64]) {
        let now = Instant::now();

        let below: Vec<u64> = self
            .pending
            .range(..cumulative)
            .map(|(&s, _)| s)
            .collect();
        for seq in below {
            if let Some(seg) = self.pending.remove(&seq) {
                self.sample_rtt(now, &seg);
            }
        }
        for seq in ooo {
            if let Some(seg) = self.pending.remove(seq) {
                self.sample_rtt(now, &seg);
            }
        }

        // anything older than the highest receipt just got skipped over
        if self.config.resend > 0 {
            if let Some(&highest) = ooo.iter().max() {
                for (_, seg) in self.pending.range_mut(..highest) {
                    seg.fast_acks += 1;
                }
            }
        }

        if !self.config.no_congestion && self.cwnd < self.config.snd_wnd {
            self.cwnd += 1;
        }
    }

    fn sample_rtt(&mut self, now: Instant, seg: &PendingSegment) {
        if seg.retries > 0 {
            return; // ambiguous sample
        }
        let rtt = now.duration_since(seg.sent_at);
        if self.srtt.is_zero() {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            let diff = if self.srtt > rtt {
                self.srtt - rtt
            } else {
                rtt - self.srtt
            };
            self.rttvar = self.rttvar * 3 / 4 + diff / 4;
            self.srtt = self.srtt * 7 / 8 + rtt / 8;
        }
        self.rto = (self.srtt + (self.rttvar * 4).max(Duration::from_millis(10)))
            .clamp(self.min_rto(), MAX_RTO);
    }

    /// Segments due for retransmission, by timeout or fast retransmit.
    pub fn retransmissions(&mut self) -> Vec<(u64, Bytes)> {
        let now = Instant::now();
        let resend = self.config.resend;
        let nodelay = self.config.nodelay;
        let mut out = Vec::new();
        let mut timed_out = false;

        for (&seq, seg) in self.pending.iter_mut() {
            let fast = resend > 0 && seg.fast_acks >= resend;
            let expired = now.duration_since(seg.sent_at) >= seg.rto;
            if !fast && !expired {
                continue;
            }
            if expired {
                timed_out = true;
                // back off the per-segment timer
                let backed_off = if nodelay {
                    seg.rto + seg.rto / 2
                } else {
                    seg.rto * 2
                };
                seg.rto = backed_off.min(MAX_RTO);
            }
            seg.sent_at = now;
            seg.retries += 1;
            seg.fast_acks = 0;
            out.push((seq, seg.payload.clone()));
        }

        if timed_out && !self.config.no_congestion {
            self.cwnd = 2;
        }
        out
    }

    /// Process a received data segment. Returns the payloads newly
    /// deliverable in order.
    pub fn on_data(&mut self, seq: u64, payload: Bytes) -> Vec<Bytes> {
        if seq < self.rcv_next || self.reorder.contains_key(&seq) {
            return Vec::new(); // duplicate
        }
        if seq >= self.rcv_next + self.config.rcv_wnd as u64 {
            return Vec::new(); // beyond the receive window, let it retransmit
        }
        self.reorder.insert(seq, payload);

        let mut delivered = Vec::new();
        while let Some(payload) = self.reorder.remove(&self.rcv_next) {
            delivered.push(payload);
            self.rcv_next += 1;
        }
        delivered
    }

    /// Build the acknowledgment for the current receive state.
    pub fn make_ack(&self) -> Packet {
        let ooo: Vec<u64> = self.reorder.keys().copied().take(64).collect();
        let wnd = (self.config.rcv_wnd - self.reorder.len().min(self.config.rcv_wnd)) as u16;
        Packet::ack(self.rcv_next, wnd, &ooo)
    }

    /// Count of contiguously received segments.
    pub fn rcv_next(&self) -> u64 {
        self.rcv_next
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }
}
