//! XOR-group forward error correction.
//!
//! For every `data_shards` data datagrams the encoder emits `parity_shards`
//! repair datagrams. The group is split into `parity_shards` contiguous
//! sub-groups; each repair packet is the XOR of one sub-group, so any single
//! loss per sub-group is recoverable.
//!
//! Repair payload layout:
//!
//! ```text
//! ┌───────────────┬───────────┬─────────┬─────────────┬───────────┐
//! │ sub_start (8) │ count (1) │ max (2) │ xor of      │           │
//! │               │           │         │ (len ‖ pad) │ ...       │
//! └───────────────┴───────────┴─────────┴─────────────┴───────────┘
//! ```
//!
//! Each member contributes `u16 len ‖ datagram bytes` zero-padded to `max`,
//! so a single missing member is recovered with its exact length.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{Packet, PacketType};

/// Generates repair packets for outgoing data datagrams.
pub struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    /// Encoded datagrams of the current group, with their seqs
    group: Vec<(u64, Bytes)>,
}

impl FecEncoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        FecEncoder {
            data_shards: data_shards.max(1),
            parity_shards: parity_shards.max(1).min(data_shards.max(1)),
            group: Vec::new(),
        }
    }

    /// Feed one encoded data datagram. Returns repair packets when the
    /// group is complete.
    pub fn push(&mut self, seq: u64, datagram: Bytes) -> Vec<Packet> {
        self.group.push((seq, datagram));
        if self.group.len() < self.data_shards {
            return Vec::new();
        }

        let group = std::mem::take(&mut self.group);
        let per_parity = group.len().div_ceil(self.parity_shards);
        group
            .chunks(per_parity)
            .map(|sub| {
                let max = sub.iter().map(|(_, d)| d.len()).max().unwrap_or(0);
                let mut xor = vec![0u8; 2 + max];
                for (_, datagram) in sub {
                    xor_into(&mut xor, datagram);
                }
                let mut payload = BytesMut::with_capacity(11 + xor.len());
                payload.put_u64(sub[0].0);
                payload.put_u8(sub.len() as u8);
                payload.put_u16(max as u16);
                payload.put_slice(&xor);
                Packet {
                    packet_type: PacketType::Fec,
                    seq: sub[0].0,
                    ack: 0,
                    wnd: 0,
                    payload: payload.freeze(),
                }
            })
            .collect()
    }
}

fn xor_into(acc: &mut [u8], datagram: &[u8]) {
    let len = datagram.len() as u16;
    acc[0] ^= (len >> 8) as u8;
    acc[1] ^= (len & 0xff) as u8;
    for (a, b) in acc[2..].iter_mut().zip(datagram) {
        *a ^= b;
    }
}

/// Recovers lost data datagrams from repair packets.
pub struct FecDecoder {
    /// Recently seen data datagrams by seq
    seen: BTreeMap<u64, Bytes>,
    /// Bound on the cache
    capacity: usize,
}

impl FecDecoder {
    pub fn new(capacity: usize) -> Self {
        FecDecoder {
            seen: BTreeMap::new(),
            capacity,
        }
    }

    /// Record a received data datagram.
    pub fn saw_data(&mut self, seq: u64, datagram: Bytes) {
        self.seen.insert(seq, datagram);
        while self.seen.len() > self.capacity {
            self.seen.pop_first();
        }
    }

    /// Process a repair packet. Returns a recovered datagram if exactly one
    /// member of the sub-group is missing.
    pub fn on_repair(&mut self, repair: &Packet) -> Option<(u64, Bytes)> {
        let mut buf = repair.payload.clone();
        if buf.remaining() < 11 {
            return None;
        }
        let sub_start = buf.get_u64();
        let count = buf.get_u8() as u64;
        let max = buf.get_u16() as usize;
        if buf.remaining() != 2 + max {
            return None;
        }

        let mut xor = buf.to_vec();
        let mut missing = None;
        for seq in sub_start..sub_start + count {
            match self.seen.get(&seq) {
                Some(datagram) => xor_into(&mut xor, datagram),
                None if missing.is_some() => return None, // two losses
                None => missing = Some(seq),
            }
        }

        let seq = missing?;
        let len = ((xor[0] as usize) << 8 | xor[1] as usize).min(max);
        let datagram = Bytes::copy_from_slice(&xor[2..2 + len]);
        self.saw_data(seq, datagram.clone());
        Some((seq, datagram))
    }
}
