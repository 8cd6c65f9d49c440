//! ARQ packet framing for the KCP transport.
//!
//! One UDP datagram carries exactly one packet.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Packet types on the UDP wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Payload-carrying segment
    Data = 0x00,
    /// Acknowledgment; `ack` is cumulative, the payload lists
    /// out-of-order receipts
    Ack = 0x01,
    /// Forward-error-correction repair packet
    Fec = 0x02,
    /// Session termination
    Fin = 0x03,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PacketType::Data),
            0x01 => Ok(PacketType::Ack),
            0x02 => Ok(PacketType::Fec),
            0x03 => Ok(PacketType::Fin),
            _ => Err(Error::protocol(format!("unknown packet type: {value}"))),
        }
    }
}

/// A transport packet.
///
/// Wire format:
/// ```text
/// ┌──────────┬──────────────┬──────────────┬─────────┬─────────┐
/// │ Type (1) │ Seq (8)      │ Ack (8)      │ Wnd (2) │ Len (2) │
/// ├──────────┴──────────────┴──────────────┴─────────┴─────────┤
/// │ Payload (variable)                                         │
/// └────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet type
    pub packet_type: PacketType,
    /// Sequence number of a data segment; group start for FEC
    pub seq: u64,
    /// Cumulative acknowledgment: every seq below this was received
    pub ack: u64,
    /// Remaining receive window of the sender, in segments
    pub wnd: u16,
    /// Payload
    pub payload: Bytes,
}

/// Header size in bytes.
pub const HEADER_SIZE: usize = 21;

/// Payload bytes per data segment. Keeps the datagram under a typical MTU.
pub const MSS: usize = 1250;

impl Packet {
    /// Create a data segment.
    pub fn data(seq: u64, payload: Bytes) -> Self {
        Packet {
            packet_type: PacketType::Data,
            seq,
            ack: 0,
            wnd: 0,
            payload,
        }
    }

    /// Create an acknowledgment. `ooo` lists out-of-order receipts above
    /// the cumulative point.
    pub fn ack(cumulative: u64, wnd: u16, ooo: &[u64]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + ooo.len() * 8);
        payload.put_u16(ooo.len() as u16);
        for seq in ooo {
            payload.put_u64(*seq);
        }
        Packet {
            packet_type: PacketType::Ack,
            seq: 0,
            ack: cumulative,
            wnd,
            payload: payload.freeze(),
        }
    }

    /// Create a session-termination packet.
    pub fn fin(seq: u64) -> Self {
        Packet {
            packet_type: PacketType::Fin,
            seq,
            ack: 0,
            wnd: 0,
            payload: Bytes::new(),
        }
    }

    /// Parse the out-of-order list of an ACK packet.
    pub fn ack_list(&self) -> Result<Vec<u64>> {
        let mut buf = self.payload.clone();
        if buf.remaining() < 2 {
            return Err(Error::protocol("truncated ack packet"));
        }
        let n = buf.get_u16() as usize;
        if buf.remaining() < n * 8 {
            return Err(Error::protocol("truncated ack list"));
        }
        Ok((0..n).map(|_| buf.get_u64()).collect())
    }

    /// Encode into wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.packet_type as u8);
        buf.put_u64(self.seq);
        buf.put_u64(self.ack);
        buf.put_u16(self.wnd);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::protocol(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let packet_type = PacketType::try_from(buf.get_u8())?;
        let seq = buf.get_u64();
        let ack = buf.get_u64();
        let wnd = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(Error::protocol(format!(
                "packet truncated: header says {len} payload bytes, got {}",
                buf.remaining()
            )));
        }
        Ok(Packet {
            packet_type,
            seq,
            ack,
            wnd,
            payload: Bytes::copy_from_slice(&buf[..len]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_roundtrip() {
        let p = Packet::data(42, Bytes::from_static(b"hello"));
        let decoded = Packet::decode(&p.encode()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Data);
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_ack_roundtrip() {
        let p = Packet::ack(100, 32, &[103, 105]);
        let decoded = Packet::decode(&p.encode()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Ack);
        assert_eq!(decoded.ack, 100);
        assert_eq!(decoded.wnd, 32);
        assert_eq!(decoded.ack_list().unwrap(), vec![103, 105]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[0xff; HEADER_SIZE]).is_err());
        // header promising more payload than present
        let mut bytes = Packet::data(0, Bytes::from_static(b"abc")).encode().to_vec();
        bytes.truncate(HEADER_SIZE + 1);
        assert!(Packet::decode(&bytes).is_err());
    }
}
