//! Wire packets
//!
//! Every datagram starts with a 16-byte header of four big-endian words:
//!
//! ```text
//! word 0  data:    0 | sequence number (31 bits)
//!         control: 1 | control type (15 bits) | type-specific info (16 bits)
//! word 1  data:    flags (retransmitted, parity, end-of-stream, parity layout)
//!         control: additional info
//! word 2  sender timestamp in microseconds (wraps)
//! word 3  session id chosen by the receiver during the handshake
//! ```
//!
//! Parity packets reuse word 0 for the base sequence number of the FEC
//! block they protect.

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

pub const HEADER_SIZE: usize = 16;

/// Largest payload that keeps a datagram inside a 1500-byte MTU
pub const MAX_PAYLOAD_SIZE: usize = 1456;

/// MPEG-TS packet size
pub const TS_PACKET_SIZE: usize = 188;

/// Seven TS packets, the customary payload of one datagram
pub const DEFAULT_PAYLOAD_SIZE: usize = TS_PACKET_SIZE * 7;

const CONTROL_FLAG: u32 = 0x8000_0000;
const SEQ_MASK: u32 = 0x7FFF_FFFF;

const FLAG_RETRANSMITTED: u32 = 1 << 31;
const FLAG_PARITY: u32 = 1 << 30;
const FLAG_END_OF_STREAM: u32 = 1 << 29;

/// Control packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlType {
    /// Connect request or response
    Handshake = 0,
    KeepAlive = 1,
    /// Receiver report, answered with AckAck for RTT measurement
    Ack = 2,
    /// Loss report requesting retransmission
    Nak = 3,
    Shutdown = 5,
    AckAck = 6,
    /// Connect refused, body carries the error code
    Reject = 8,
    /// Receiver asks the sender for a new parity overhead
    FecUpdate = 9,
    /// Receiver selects a bitrate variant
    BitrateSwitch = 10,
    /// Pause, resume or seek on a finite stream
    StreamControl = 11,
}

impl ControlType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ControlType::Handshake),
            1 => Some(ControlType::KeepAlive),
            2 => Some(ControlType::Ack),
            3 => Some(ControlType::Nak),
            5 => Some(ControlType::Shutdown),
            6 => Some(ControlType::AckAck),
            8 => Some(ControlType::Reject),
            9 => Some(ControlType::FecUpdate),
            10 => Some(ControlType::BitrateSwitch),
            11 => Some(ControlType::StreamControl),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Layout of a parity packet within its FEC block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityInfo {
    /// Source packets covered by the block (`k`)
    pub source_count: u8,
    /// Index of this parity symbol (`0..parity_count`)
    pub index: u8,
    /// Parity symbols generated for the block (`m`)
    pub parity_count: u8,
}

/// Data packet flags (header word 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFlags {
    pub retransmitted: bool,
    pub end_of_stream: bool,
    pub parity: Option<ParityInfo>,
}

impl DataFlags {
    pub fn from_raw(raw: u32) -> Self {
        let parity = if raw & FLAG_PARITY != 0 {
            Some(ParityInfo {
                source_count: (raw & 0xFF) as u8,
                index: ((raw >> 8) & 0xFF) as u8,
                parity_count: ((raw >> 16) & 0xFF) as u8,
            })
        } else {
            None
        };

        DataFlags {
            retransmitted: raw & FLAG_RETRANSMITTED != 0,
            end_of_stream: raw & FLAG_END_OF_STREAM != 0,
            parity,
        }
    }

    pub fn to_raw(self) -> u32 {
        let mut raw = 0;
        if self.retransmitted {
            raw |= FLAG_RETRANSMITTED;
        }
        if self.end_of_stream {
            raw |= FLAG_END_OF_STREAM;
        }
        if let Some(parity) = self.parity {
            raw |= FLAG_PARITY;
            raw |= parity.source_count as u32;
            raw |= (parity.index as u32) << 8;
            raw |= (parity.parity_count as u32) << 16;
        }
        raw
    }
}

/// Raw 16-byte header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq_or_control: u32,
    pub flags_or_info: u32,
    pub timestamp: u32,
    pub session_id: u32,
}

impl PacketHeader {
    #[inline]
    pub fn is_control(&self) -> bool {
        self.seq_or_control & CONTROL_FLAG != 0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[..HEADER_SIZE];
        Ok(PacketHeader {
            seq_or_control: buf.get_u32(),
            flags_or_info: buf.get_u32(),
            timestamp: buf.get_u32(),
            session_id: buf.get_u32(),
        })
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq_or_control);
        buf.put_u32(self.flags_or_info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.session_id);
    }
}

/// Media or parity packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Sequence number, or block base for parity packets
    pub seq: SeqNumber,
    pub flags: DataFlags,
    pub timestamp: u32,
    pub session_id: u32,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn new(seq: SeqNumber, timestamp: u32, session_id: u32, payload: Bytes) -> Self {
        DataPacket {
            seq,
            flags: DataFlags::default(),
            timestamp,
            session_id,
            payload,
        }
    }

    /// Empty packet marking the end of a finite stream
    pub fn end_of_stream(seq: SeqNumber, timestamp: u32, session_id: u32) -> Self {
        DataPacket {
            flags: DataFlags {
                end_of_stream: true,
                ..DataFlags::default()
            },
            ..DataPacket::new(seq, timestamp, session_id, Bytes::new())
        }
    }

    pub fn is_parity(&self) -> bool {
        self.flags.parity.is_some()
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            seq_or_control: self.seq.as_raw() & SEQ_MASK,
            flags_or_info: self.flags.to_raw(),
            timestamp: self.timestamp,
            session_id: self.session_id,
        }
    }

    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header().write_to(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let header = PacketHeader::from_bytes(bytes)?;
        if header.is_control() {
            return Err(PacketError::WrongPacketType {
                expected: "data",
                actual: "control",
            });
        }
        if bytes.len() - HEADER_SIZE > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge {
                size: bytes.len() - HEADER_SIZE,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(DataPacket {
            seq: SeqNumber::new_unchecked(header.seq_or_control),
            flags: DataFlags::from_raw(header.flags_or_info),
            timestamp: header.timestamp,
            session_id: header.session_id,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}

/// Control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub control_type: ControlType,
    pub type_info: u16,
    pub additional_info: u32,
    pub timestamp: u32,
    pub session_id: u32,
    pub body: Bytes,
}

impl ControlPacket {
    pub fn new(control_type: ControlType, session_id: u32, body: Bytes) -> Self {
        ControlPacket {
            control_type,
            type_info: 0,
            additional_info: 0,
            timestamp: 0,
            session_id,
            body,
        }
    }

    pub fn with_info(mut self, type_info: u16, additional_info: u32) -> Self {
        self.type_info = type_info;
        self.additional_info = additional_info;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            seq_or_control: CONTROL_FLAG
                | ((self.control_type.as_u16() as u32) << 16)
                | self.type_info as u32,
            flags_or_info: self.additional_info,
            timestamp: self.timestamp,
            session_id: self.session_id,
        }
    }

    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header().write_to(&mut buf);
        buf.put_slice(&self.body);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let header = PacketHeader::from_bytes(bytes)?;
        if !header.is_control() {
            return Err(PacketError::WrongPacketType {
                expected: "control",
                actual: "data",
            });
        }

        let raw_type = ((header.seq_or_control >> 16) & 0x7FFF) as u16;
        let control_type =
            ControlType::from_u16(raw_type).ok_or(PacketError::InvalidControlType(raw_type))?;

        Ok(ControlPacket {
            control_type,
            type_info: (header.seq_or_control & 0xFFFF) as u16,
            additional_info: header.flags_or_info,
            timestamp: header.timestamp,
            session_id: header.session_id,
            body: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}

/// Either kind of packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    pub fn session_id(&self) -> u32 {
        match self {
            Packet::Data(p) => p.session_id,
            Packet::Control(p) => p.session_id,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Packet::Data(p) => p.size(),
            Packet::Control(p) => p.size(),
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        match self {
            Packet::Data(p) => p.to_bytes(),
            Packet::Control(p) => p.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if PacketHeader::from_bytes(bytes)?.is_control() {
            Ok(Packet::Control(ControlPacket::from_bytes(bytes)?))
        } else {
            Ok(Packet::Data(DataPacket::from_bytes(bytes)?))
        }
    }
}

impl From<DataPacket> for Packet {
    fn from(packet: DataPacket) -> Self {
        Packet::Data(packet)
    }
}

impl From<ControlPacket> for Packet {
    fn from(packet: ControlPacket) -> Self {
        Packet::Control(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Data(p) if p.is_parity() => write!(f, "Parity(base={})", p.seq),
            Packet::Data(p) => write!(f, "Data(seq={}, {} bytes)", p.seq, p.payload.len()),
            Packet::Control(p) => write!(f, "Control({:?})", p.control_type),
        }
    }
}

/// MPEG-TS null packets covering roughly `len` bytes, at least one
pub fn null_filler(len: usize) -> Bytes {
    let count = (len / TS_PACKET_SIZE).max(1);
    let mut buf = BytesMut::with_capacity(count * TS_PACKET_SIZE);
    for _ in 0..count {
        buf.put_slice(&[0x47, 0x1F, 0xFF, 0x10]);
        buf.put_bytes(0xFF, TS_PACKET_SIZE - 4);
    }
    buf.freeze()
}

/// True when every TS packet in `payload` is on the null PID
pub fn is_null_filler(payload: &[u8]) -> bool {
    !payload.is_empty()
        && payload.len() % TS_PACKET_SIZE == 0
        && payload
            .chunks_exact(TS_PACKET_SIZE)
            .all(|ts| ts[0] == 0x47 && ts[1] & 0x1F == 0x1F && ts[2] == 0xFF)
}

/// Packet parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Wrong packet type: expected {expected}, got {actual}")]
    WrongPacketType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid control type: {0}")]
    InvalidControlType(u16),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed {0} body")]
    MalformedBody(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_filler() {
        let filler = null_filler(DEFAULT_PAYLOAD_SIZE);
        assert_eq!(filler.len(), DEFAULT_PAYLOAD_SIZE);
        assert!(is_null_filler(&filler));
        assert_eq!(null_filler(10).len(), TS_PACKET_SIZE);
        assert!(!is_null_filler(&[0x47u8; TS_PACKET_SIZE]));
        assert!(!is_null_filler(&[]));
    }

    #[test]
    fn test_parity_flags_layout() {
        let flags = DataFlags {
            retransmitted: false,
            end_of_stream: false,
            parity: Some(ParityInfo {
                source_count: 20,
                index: 3,
                parity_count: 6,
            }),
        };
        let raw = flags.to_raw();
        assert_eq!(raw & 0xFF, 20);
        assert_eq!((raw >> 8) & 0xFF, 3);
        assert_eq!((raw >> 16) & 0xFF, 6);
        assert_eq!(DataFlags::from_raw(raw), flags);
    }

    #[test]
    fn test_data_packet_wire_format() {
        let packet = DataPacket::new(
            SeqNumber::new(77),
            1234,
            42,
            Bytes::from_static(b"payload"),
        );
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 7);
        assert_eq!(&bytes[0..4], &77u32.to_be_bytes());
        assert_eq!(&bytes[12..16], &42u32.to_be_bytes());

        match Packet::from_bytes(&bytes).unwrap() {
            Packet::Data(decoded) => assert_eq!(decoded, packet),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_control_packet_wire_format() {
        let packet = ControlPacket::new(ControlType::Nak, 9, Bytes::from_static(&[1, 2, 3, 4]))
            .with_info(0xBEEF, 5)
            .with_timestamp(100);
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0] & 0x80, 0x80);

        let decoded = ControlPacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_unknown_control_type_rejected() {
        let mut bytes = ControlPacket::new(ControlType::KeepAlive, 0, Bytes::new()).to_bytes();
        bytes[1] = 0x7F;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::InvalidControlType(_))
        ));
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert_eq!(
            Packet::from_bytes(&[0u8; 5]),
            Err(PacketError::InsufficientData {
                expected: HEADER_SIZE,
                actual: 5
            })
        );
    }

    #[test]
    fn test_end_of_stream_marker() {
        let eos = DataPacket::end_of_stream(SeqNumber::new(10), 0, 1);
        let decoded = DataPacket::from_bytes(&eos.to_bytes()).unwrap();
        assert!(decoded.flags.end_of_stream);
        assert!(decoded.payload.is_empty());
        assert!(!decoded.is_parity());
    }
}
