//! Connection handshake
//!
//! A caller sends a [`ConnectRequest`] inside a `Handshake` control packet.
//! The peer answers with a [`ConnectResponse`] or a `Reject` packet whose
//! additional-info word holds an [`ErrorCode`](crate::ErrorCode) value. The
//! caller picks the session id carried in header word 3; the responder
//! echoes it on every packet of that connection so packets from an earlier
//! connection can be told apart after a reconnect.

use crate::packet::PacketError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 2 };

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

/// Protocol version; peers must agree on `major`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

/// Which way media flows relative to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    /// Caller receives media (client connecting to a source)
    Pull = 1,
    /// Caller sends media (feeder connecting to an accepting client)
    Push = 2,
}

impl Role {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Role::Pull),
            2 => Some(Role::Push),
            _ => None,
        }
    }
}

/// Error-correction parameters negotiated for the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    /// 0 off, 1 fixed overhead, 2 adaptive
    pub mode: u8,
    pub arq: bool,
    /// Parity overhead in percent of source packets
    pub overhead: u8,
    pub block_ms: u16,
    pub content_aware: bool,
}

impl Default for FecParams {
    fn default() -> Self {
        FecParams {
            mode: 0,
            arq: true,
            overhead: 30,
            block_ms: 50,
            content_aware: false,
        }
    }
}

impl FecParams {
    pub fn fec_enabled(&self) -> bool {
        self.mode != 0 && self.overhead > 0
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.mode);
        buf.put_u8(self.arq as u8);
        buf.put_u8(self.overhead);
        buf.put_u16(self.block_ms);
        buf.put_u8(self.content_aware as u8);
    }

    fn read_from(buf: &mut &[u8]) -> Result<Self, PacketError> {
        need(buf, 6)?;
        Ok(FecParams {
            mode: buf.get_u8(),
            arq: buf.get_u8() != 0,
            overhead: buf.get_u8(),
            block_ms: buf.get_u16(),
            content_aware: buf.get_u8() != 0,
        })
    }
}

/// Properties of the connected source
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub live: bool,
    /// Size in bytes for finite (VOD) sources, 0 when live
    pub file_size: u64,
    pub width: u16,
    pub height: u16,
    /// Advertised bitrate variants in bits per second, ascending
    pub bitrates: Vec<u32>,
    pub channel: String,
}

impl StreamInfo {
    pub fn live(channel: impl Into<String>) -> Self {
        StreamInfo {
            live: true,
            channel: channel.into(),
            ..StreamInfo::default()
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.live as u8);
        buf.put_u64(self.file_size);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u8(self.bitrates.len() as u8);
        for bitrate in &self.bitrates {
            buf.put_u32(*bitrate);
        }
        put_str(buf, &self.channel);
    }

    fn read_from(buf: &mut &[u8]) -> Result<Self, PacketError> {
        need(buf, 14)?;
        let live = buf.get_u8() != 0;
        let file_size = buf.get_u64();
        let width = buf.get_u16();
        let height = buf.get_u16();
        let count = buf.get_u8() as usize;
        need(buf, count * 4)?;
        let bitrates = (0..count).map(|_| buf.get_u32()).collect();
        let channel = get_str(buf)?;

        Ok(StreamInfo {
            live,
            file_size,
            width,
            height,
            bitrates,
            channel,
        })
    }
}

/// Connect request sent by the calling side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: ProtocolVersion,
    pub role: Role,
    pub guid: String,
    pub session_token: String,
    pub channel: String,
    pub latency_ms: u32,
    pub low_latency: bool,
    pub fec: FecParams,
    /// Source description, present when the caller pushes media
    pub stream: Option<StreamInfo>,
}

impl ConnectRequest {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(KIND_REQUEST);
        buf.put_u16(self.version.major);
        buf.put_u16(self.version.minor);
        buf.put_u8(self.role as u8);
        put_str(&mut buf, &self.guid);
        put_str(&mut buf, &self.session_token);
        put_str(&mut buf, &self.channel);
        buf.put_u32(self.latency_ms);
        buf.put_u8(self.low_latency as u8);
        self.fec.write_to(&mut buf);
        match &self.stream {
            Some(info) => {
                buf.put_u8(1);
                info.write_to(&mut buf);
            }
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut buf = bytes;
        need(&buf, 6)?;
        if buf.get_u8() != KIND_REQUEST {
            return Err(PacketError::MalformedBody("connect request"));
        }
        let version = ProtocolVersion {
            major: buf.get_u16(),
            minor: buf.get_u16(),
        };
        let role = Role::from_u8(buf.get_u8()).ok_or(PacketError::MalformedBody("role"))?;
        let guid = get_str(&mut buf)?;
        let session_token = get_str(&mut buf)?;
        let channel = get_str(&mut buf)?;
        need(&buf, 5)?;
        let latency_ms = buf.get_u32();
        let low_latency = buf.get_u8() != 0;
        let fec = FecParams::read_from(&mut buf)?;
        need(&buf, 1)?;
        let stream = match buf.get_u8() {
            0 => None,
            _ => Some(StreamInfo::read_from(&mut buf)?),
        };

        Ok(ConnectRequest {
            version,
            role,
            guid,
            session_token,
            channel,
            latency_ms,
            low_latency,
            fec,
            stream,
        })
    }

    /// Peek whether a handshake body is a request
    pub fn is_request(bytes: &[u8]) -> bool {
        bytes.first() == Some(&KIND_REQUEST)
    }
}

/// Connect response sent by the answering side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub version: ProtocolVersion,
    /// Stream description when the responder is the media source
    pub stream: StreamInfo,
    /// Error-correction parameters the sender will use
    pub fec: FecParams,
}

impl ConnectResponse {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(KIND_RESPONSE);
        buf.put_u16(self.version.major);
        buf.put_u16(self.version.minor);
        self.fec.write_to(&mut buf);
        self.stream.write_to(&mut buf);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut buf = bytes;
        need(&buf, 5)?;
        if buf.get_u8() != KIND_RESPONSE {
            return Err(PacketError::MalformedBody("connect response"));
        }
        let version = ProtocolVersion {
            major: buf.get_u16(),
            minor: buf.get_u16(),
        };
        let fec = FecParams::read_from(&mut buf)?;
        let stream = StreamInfo::read_from(&mut buf)?;
        Ok(ConnectResponse {
            version,
            stream,
            fec,
        })
    }
}

fn need(buf: &&[u8], len: usize) -> Result<(), PacketError> {
    if buf.remaining() < len {
        Err(PacketError::InsufficientData {
            expected: len,
            actual: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn get_str(buf: &mut &[u8]) -> Result<String, PacketError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let value = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| PacketError::MalformedBody("string"))?;
    buf.advance(len);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            version: PROTOCOL_VERSION,
            role: Role::Pull,
            guid: "receiver-01".to_string(),
            session_token: "secret".to_string(),
            channel: "news".to_string(),
            latency_ms: 300,
            low_latency: false,
            fec: FecParams {
                mode: 1,
                arq: false,
                overhead: 20,
                block_ms: 30,
                content_aware: true,
            },
            stream: None,
        }
    }

    #[test]
    fn test_request_body() {
        let req = request();
        let bytes = req.to_bytes();
        assert!(ConnectRequest::is_request(&bytes));
        assert_eq!(ConnectRequest::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_push_request_carries_stream() {
        let mut req = request();
        req.role = Role::Push;
        req.stream = Some(StreamInfo {
            bitrates: vec![1_000_000, 3_000_000],
            ..StreamInfo::live("news")
        });
        let decoded = ConnectRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded.stream.unwrap().bitrates, vec![1_000_000, 3_000_000]);
    }

    #[test]
    fn test_response_body() {
        let resp = ConnectResponse {
            version: PROTOCOL_VERSION,
            stream: StreamInfo {
                live: false,
                file_size: 10_485_760,
                width: 1920,
                height: 1080,
                bitrates: vec![],
                channel: "movie".to_string(),
            },
            fec: FecParams::default(),
        };
        let bytes = resp.to_bytes();
        assert!(!ConnectRequest::is_request(&bytes));
        assert_eq!(ConnectResponse::from_bytes(&bytes).unwrap(), resp);
    }

    #[test]
    fn test_truncated_body() {
        let bytes = request().to_bytes();
        assert!(ConnectRequest::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_version_compatibility() {
        let newer = ProtocolVersion { major: 1, minor: 9 };
        let other = ProtocolVersion { major: 2, minor: 0 };
        assert!(PROTOCOL_VERSION.is_compatible(&newer));
        assert!(!PROTOCOL_VERSION.is_compatible(&other));
    }
}
