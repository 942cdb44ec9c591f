//! Packet framing for audio datagrams
//!
//! ## Packet Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                Audio Packet Header (12 bytes)            │
//! ├──────────────────────┬───────────────────────────────────┤
//! │       Seq(4)         │          Timestamp(8)             │
//! │  u32 BE, wraps 2^32  │   u64 BE, wall clock (ms)         │
//! ├──────────────────────┴───────────────────────────────────┤
//! │                 Codec Payload (variable)                 │
//! │             Max: 65507 - 12 = 65495 bytes                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Payloads that do not fit in one datagram are rejected, never fragmented.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Maximum payload size that still fits in one datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Fixed datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Per-session sequence number
    pub sequence: u32,
    /// Sender wall clock at send time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Audio packet for network transmission
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub header: PacketHeader,

    /// Encoded audio data
    pub payload: Bytes,
}

impl AudioPacket {
    /// Create a new audio packet
    pub fn new(sequence: u32, timestamp_ms: u64, payload: Bytes) -> Self {
        Self {
            header: PacketHeader {
                sequence,
                timestamp_ms,
            },
            payload,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.header.timestamp_ms
    }

    /// Serialize packet to bytes for network transmission
    pub fn serialize(&self) -> Result<Bytes, NetworkError> {
        let total = self.total_size();
        if total > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::PacketTooLarge(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(self.header.sequence);
        buf.put_u64(self.header.timestamp_ms);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Deserialize packet from bytes
    ///
    /// The payload is a zero-copy slice of `data`.
    pub fn deserialize(mut data: Bytes) -> Result<Self, NetworkError> {
        if data.len() < HEADER_SIZE {
            return Err(NetworkError::MalformedPacket(data.len()));
        }

        let sequence = data.get_u32();
        let timestamp_ms = data.get_u64();

        Ok(Self::new(sequence, timestamp_ms, data))
    }

    /// Get packet size including header
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Prepend the header to `payload`.
pub fn pack(sequence: u32, timestamp_ms: u64, payload: &[u8]) -> Result<Bytes, NetworkError> {
    AudioPacket::new(sequence, timestamp_ms, Bytes::copy_from_slice(payload)).serialize()
}

/// Write header and `payload` into `out`, replacing its contents.
///
/// Lets the sender reuse one buffer for every packet.
pub fn pack_into(
    sequence: u32,
    timestamp_ms: u64,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), NetworkError> {
    let total = HEADER_SIZE + payload.len();
    if total > MAX_DATAGRAM_SIZE {
        return Err(NetworkError::PacketTooLarge(total));
    }

    out.clear();
    out.put_u32(sequence);
    out.put_u64(timestamp_ms);
    out.put_slice(payload);
    Ok(())
}

/// Split a datagram into `(sequence, timestamp_ms, payload)`.
pub fn unpack(datagram: Bytes) -> Result<(u32, u64, Bytes), NetworkError> {
    let packet = AudioPacket::deserialize(datagram)?;
    Ok((packet.sequence(), packet.timestamp_ms(), packet.payload))
}

/// Current wall clock in milliseconds, as written into the header
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let data = pack(0x0102_0304, 0x0A0B_0C0D_0E0F_1011, &[0xFF, 0xEE]).unwrap();

        assert_eq!(
            data.as_ref(),
            &[
                0x01, 0x02, 0x03, 0x04, // sequence
                0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, // timestamp
                0xFF, 0xEE, // payload
            ]
        );
    }

    #[test]
    fn test_packet_serialization() {
        let packet = AudioPacket::new(12345, 9876543210, Bytes::from_static(&[1, 2, 3, 4, 5]));

        let serialized = packet.serialize().unwrap();
        assert_eq!(serialized.len(), HEADER_SIZE + 5);

        let deserialized = AudioPacket::deserialize(serialized).unwrap();
        assert_eq!(deserialized.sequence(), 12345);
        assert_eq!(deserialized.timestamp_ms(), 9876543210);
        assert_eq!(deserialized.payload.as_ref(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_header_only_packet_has_empty_payload() {
        let (seq, ts, payload) = unpack(pack(7, 42, &[]).unwrap()).unwrap();
        assert_eq!((seq, ts), (7, 42));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_short_datagram_is_malformed() {
        for len in 0..HEADER_SIZE {
            let data = Bytes::from(vec![0u8; len]);
            match unpack(data) {
                Err(NetworkError::MalformedPacket(n)) => assert_eq!(n, len),
                other => panic!("expected MalformedPacket, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            pack(0, 0, &payload),
            Err(NetworkError::PacketTooLarge(n)) if n == MAX_DATAGRAM_SIZE + 1
        ));

        let payload = vec![0u8; MAX_PAYLOAD_SIZE];
        assert_eq!(pack(0, 0, &payload).unwrap().len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_pack_into_reuses_buffer() {
        let mut out = Vec::new();
        pack_into(1, 2, &[9; 100], &mut out).unwrap();
        assert_eq!(out.len(), HEADER_SIZE + 100);

        pack_into(3, 4, &[7], &mut out).unwrap();
        assert_eq!(out, pack(3, 4, &[7]).unwrap().as_ref());
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }
}
