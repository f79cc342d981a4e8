//! # Wire format
//!
//! Fixed 38-byte header, followed by the payload and a trailing 4-byte
//! CRC-32/IEEE checksum computed over header + payload. All multi-byte
//! integers are big-endian.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    version    |     type      |             flags             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          session_id (64)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         sequence_id (64)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     timestamp_ns (64, signed)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    wan_id     |   priority    |         data_len (32)          ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ...                   |                group_id (32)             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           payload ...                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         crc32 (32)                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `group_id` ties a packet to its FEC erasure-coding group; it is zero on
//! packets that carry no FEC shard.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Protocol version this codec speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 38;

/// Trailing checksum length in bytes.
pub const CRC_LEN: usize = 4;

/// Minimum total wire length (empty payload).
pub const MIN_WIRE_LEN: usize = HEADER_LEN + CRC_LEN;

// ─── Packet type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    Heartbeat = 2,
    Control = 3,
    Multicast = 4,
    Fec = 5,
}

impl PacketType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Ack),
            2 => Some(PacketType::Heartbeat),
            3 => Some(PacketType::Control),
            4 => Some(PacketType::Multicast),
            5 => Some(PacketType::Fec),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketType::Data => "data",
            PacketType::Ack => "ack",
            PacketType::Heartbeat => "heartbeat",
            PacketType::Control => "control",
            PacketType::Multicast => "multicast",
            PacketType::Fec => "fec",
        };
        f.write_str(s)
    }
}

// ─── Flags ───────────────────────────────────────────────────────────────────

/// Header flag bits, packed as a big-endian `u16` on the wire. A small
/// hand-rolled bitset rather than a `bitflags` dependency — six fixed bits,
/// no need for the macro-generated surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    pub const DUPLICATE: Flags = Flags(0b0000_0001);
    pub const FEC: Flags = Flags(0b0000_0010);
    pub const COMPRESSED: Flags = Flags(0b0000_0100);
    pub const ENCRYPTED: Flags = Flags(0b0000_1000);
    pub const FRAGMENT: Flags = Flags(0b0001_0000);
    pub const LAST_FRAGMENT: Flags = Flags(0b0010_0000);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u16) -> Self {
        Flags(bits)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Flags(self.0 | rhs.0)
    }
}

// ─── Decode errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram shorter than the minimum wire length")]
    TooShort,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("data_len field does not match the remaining payload length")]
    BadLength,
    #[error("CRC-32 checksum mismatch")]
    ChecksumMismatch,
}

// ─── Header ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: Flags,
    pub session_id: u64,
    pub sequence_id: u64,
    pub timestamp_ns: i64,
    pub wan_id: u8,
    pub priority: u8,
    pub data_len: u32,
    pub group_id: u32,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u64(self.session_id);
        buf.put_u64(self.sequence_id);
        buf.put_i64(self.timestamp_ns);
        buf.put_u8(self.wan_id);
        buf.put_u8(self.priority);
        buf.put_u32(self.data_len);
        buf.put_u32(self.group_id);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < HEADER_LEN {
            return Err(DecodeError::TooShort);
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion);
        }
        let packet_type = PacketType::from_byte(buf.get_u8()).ok_or(DecodeError::BadLength)?;
        let flags = Flags::from_bits_truncate(buf.get_u16());
        let session_id = buf.get_u64();
        let sequence_id = buf.get_u64();
        let timestamp_ns = buf.get_i64();
        let wan_id = buf.get_u8();
        let priority = buf.get_u8();
        let data_len = buf.get_u32();
        let group_id = buf.get_u32();
        Ok(PacketHeader {
            version,
            packet_type,
            flags,
            session_id,
            sequence_id,
            timestamp_ns,
            wan_id,
            priority,
            data_len,
            group_id,
        })
    }
}

// ─── Full packet ─────────────────────────────────────────────────────────────

/// A decoded packet: header + payload. The trailing CRC is verified during
/// [`Packet::decode`] and not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Build a new packet with the given header fields; the header's
    /// `data_len` is derived from `payload`.
    pub fn new(mut header: PacketHeader, payload: Bytes) -> Self {
        header.data_len = payload.len() as u32;
        Packet { header, payload }
    }

    /// Serialize header + payload + CRC-32/IEEE trailer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }

    /// Decode a complete datagram, verifying length and checksum.
    ///
    /// Never panics on arbitrary input — every malformed case returns a
    /// [`DecodeError`] instead.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < MIN_WIRE_LEN {
            return Err(DecodeError::TooShort);
        }
        let (body, crc_bytes) = data.split_at(data.len() - CRC_LEN);
        let expected_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
        let actual_crc = crc32fast::hash(body);
        if actual_crc != expected_crc {
            return Err(DecodeError::ChecksumMismatch);
        }

        let mut cursor = body;
        let header = PacketHeader::decode(&mut cursor)?;
        if cursor.remaining() != header.data_len as usize {
            return Err(DecodeError::BadLength);
        }
        let payload = Bytes::copy_from_slice(cursor.chunk());
        Ok(Packet { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(session_id: u64, sequence_id: u64, wan_id: u8) -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Data,
            flags: Flags::empty(),
            session_id,
            sequence_id,
            timestamp_ns: 0,
            wan_id,
            priority: 0,
            data_len: 0,
            group_id: 0,
        }
    }

    /// Scenario 1: a 5-byte payload produces a 47-byte datagram
    /// (38-byte header + 5-byte payload + 4-byte CRC).
    #[test]
    fn scenario_1_exact_wire_length() {
        let pkt = Packet::new(
            header(0x1122_3344_5566_7788, 1, 2),
            Bytes::from_static(b"hello"),
        );
        let encoded = pkt.encode();
        assert_eq!(encoded.len(), 47);

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.header.session_id, 0x1122_3344_5566_7788);
        assert_eq!(decoded.header.sequence_id, 1);
        assert_eq!(decoded.header.wan_id, 2);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    /// Scenario 2: flipping a single payload byte must yield ChecksumMismatch.
    #[test]
    fn scenario_2_payload_bitflip_is_checksum_mismatch() {
        let pkt = Packet::new(header(1, 1, 0), Bytes::from_static(b"hello"));
        let mut encoded = pkt.encode().to_vec();
        let payload_offset = HEADER_LEN;
        encoded[payload_offset] ^= 0x01;
        let err = Packet::decode(&encoded).unwrap_err();
        assert_eq!(err, DecodeError::ChecksumMismatch);
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        for len in 0..64 {
            let data = vec![0xAAu8; len];
            let _ = Packet::decode(&data);
        }
        let data = vec![0xFFu8; 100];
        let _ = Packet::decode(&data);
    }

    #[test]
    fn too_short_is_rejected() {
        let data = vec![0u8; MIN_WIRE_LEN - 1];
        assert_eq!(Packet::decode(&data).unwrap_err(), DecodeError::TooShort);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let pkt = Packet::new(header(1, 1, 0), Bytes::from_static(b"x"));
        let mut encoded = pkt.encode().to_vec();
        encoded[0] = 99;
        let crc = crc32fast::hash(&encoded[..encoded.len() - CRC_LEN]);
        let len = encoded.len();
        encoded[len - 4..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(
            Packet::decode(&encoded).unwrap_err(),
            DecodeError::UnsupportedVersion
        );
    }

    proptest! {
        #[test]
        fn proptest_roundtrip(
            session_id in any::<u64>(),
            sequence_id in any::<u64>(),
            wan_id in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let pkt = Packet::new(header(session_id, sequence_id, wan_id), Bytes::from(payload.clone()));
            let encoded = pkt.encode();
            let decoded = Packet::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.header.session_id, session_id);
            prop_assert_eq!(decoded.header.sequence_id, sequence_id);
            prop_assert_eq!(decoded.header.wan_id, wan_id);
            prop_assert_eq!(&decoded.payload[..], &payload[..]);
        }

        #[test]
        fn proptest_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Packet::decode(&data);
        }
    }
}
