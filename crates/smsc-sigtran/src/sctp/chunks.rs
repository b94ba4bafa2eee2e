//! SCTP packet and chunk encoding/decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::crc32c;
use crate::errors::SctpError;

/// Chunk type octets (RFC 4960 §3.2)
pub mod chunk_type {
    pub const DATA: u8 = 0;
    pub const INIT: u8 = 1;
    pub const INIT_ACK: u8 = 2;
    pub const SACK: u8 = 3;
    pub const HEARTBEAT: u8 = 4;
    pub const HEARTBEAT_ACK: u8 = 5;
    pub const ABORT: u8 = 6;
    pub const SHUTDOWN: u8 = 7;
    pub const SHUTDOWN_ACK: u8 = 8;
    pub const ERROR: u8 = 9;
    pub const COOKIE_ECHO: u8 = 10;
    pub const COOKIE_ACK: u8 = 11;
    pub const SHUTDOWN_COMPLETE: u8 = 14;
}

/// SCTP Common Header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
}

impl SctpHeader {
    pub const SIZE: usize = 12;
}

/// DATA Chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub tsn: u32,
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub user_data: Bytes,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
}

impl DataChunk {
    /// Unfragmented, ordered user message
    pub fn new(tsn: u32, stream_id: u16, stream_seq: u16, ppid: u32, user_data: Bytes) -> Self {
        Self {
            tsn,
            stream_id,
            stream_seq,
            ppid,
            user_data,
            unordered: false,
            beginning: true,
            ending: true,
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.unordered {
            flags |= 0x04;
        }
        if self.beginning {
            flags |= 0x02;
        }
        if self.ending {
            flags |= 0x01;
        }
        flags
    }
}

/// INIT and INIT ACK body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitChunk {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    /// State cookie, present only in INIT ACK
    pub cookie: Option<Bytes>,
}

/// SACK body; gap blocks and duplicates are counted, not kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackChunk {
    pub cumulative_tsn_ack: u32,
    pub a_rwnd: u32,
}

/// One chunk of an SCTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(DataChunk),
    Init(InitChunk),
    InitAck(InitChunk),
    Sack(SackChunk),
    Heartbeat(Bytes),
    HeartbeatAck(Bytes),
    Abort { reflected: bool },
    Shutdown { cumulative_tsn_ack: u32 },
    ShutdownAck,
    Error(Bytes),
    CookieEcho(Bytes),
    CookieAck,
    ShutdownComplete { reflected: bool },
    Unknown { chunk_type: u8, flags: u8, value: Bytes },
}

const PARAM_HEARTBEAT_INFO: u16 = 1;
const PARAM_STATE_COOKIE: u16 = 7;

fn pad(buf: &mut BytesMut, len: usize) {
    for _ in 0..(4 - len % 4) % 4 {
        buf.put_u8(0);
    }
}

fn put_chunk(buf: &mut BytesMut, chunk_type: u8, flags: u8, value: &[u8]) {
    buf.put_u8(chunk_type);
    buf.put_u8(flags);
    buf.put_u16((4 + value.len()) as u16);
    buf.put_slice(value);
    pad(buf, value.len());
}

fn put_param(buf: &mut BytesMut, tag: u16, value: &[u8]) {
    buf.put_u16(tag);
    buf.put_u16((4 + value.len()) as u16);
    buf.put_slice(value);
    pad(buf, value.len());
}

impl Chunk {
    pub fn chunk_type(&self) -> u8 {
        match self {
            Self::Data(_) => chunk_type::DATA,
            Self::Init(_) => chunk_type::INIT,
            Self::InitAck(_) => chunk_type::INIT_ACK,
            Self::Sack(_) => chunk_type::SACK,
            Self::Heartbeat(_) => chunk_type::HEARTBEAT,
            Self::HeartbeatAck(_) => chunk_type::HEARTBEAT_ACK,
            Self::Abort { .. } => chunk_type::ABORT,
            Self::Shutdown { .. } => chunk_type::SHUTDOWN,
            Self::ShutdownAck => chunk_type::SHUTDOWN_ACK,
            Self::Error(_) => chunk_type::ERROR,
            Self::CookieEcho(_) => chunk_type::COOKIE_ECHO,
            Self::CookieAck => chunk_type::COOKIE_ACK,
            Self::ShutdownComplete { .. } => chunk_type::SHUTDOWN_COMPLETE,
            Self::Unknown { chunk_type, .. } => *chunk_type,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let chunk_type = self.chunk_type();
        match self {
            Self::Data(data) => {
                let mut value = BytesMut::with_capacity(12 + data.user_data.len());
                value.put_u32(data.tsn);
                value.put_u16(data.stream_id);
                value.put_u16(data.stream_seq);
                value.put_u32(data.ppid);
                value.put_slice(&data.user_data);
                put_chunk(buf, chunk_type, data.flags(), &value);
            }
            Self::Init(init) | Self::InitAck(init) => {
                let mut value = BytesMut::with_capacity(32);
                value.put_u32(init.initiate_tag);
                value.put_u32(init.a_rwnd);
                value.put_u16(init.outbound_streams);
                value.put_u16(init.inbound_streams);
                value.put_u32(init.initial_tsn);
                if let Some(cookie) = &init.cookie {
                    put_param(&mut value, PARAM_STATE_COOKIE, cookie);
                }
                put_chunk(buf, chunk_type, 0, &value);
            }
            Self::Sack(sack) => {
                let mut value = BytesMut::with_capacity(12);
                value.put_u32(sack.cumulative_tsn_ack);
                value.put_u32(sack.a_rwnd);
                value.put_u16(0);
                value.put_u16(0);
                put_chunk(buf, chunk_type, 0, &value);
            }
            Self::Heartbeat(info) | Self::HeartbeatAck(info) => {
                let mut value = BytesMut::with_capacity(4 + info.len());
                put_param(&mut value, PARAM_HEARTBEAT_INFO, info);
                put_chunk(buf, chunk_type, 0, &value);
            }
            Self::Abort { reflected } | Self::ShutdownComplete { reflected } => {
                put_chunk(buf, chunk_type, u8::from(*reflected), &[]);
            }
            Self::Shutdown { cumulative_tsn_ack } => {
                put_chunk(buf, chunk_type, 0, &cumulative_tsn_ack.to_be_bytes());
            }
            Self::ShutdownAck | Self::CookieAck => put_chunk(buf, chunk_type, 0, &[]),
            Self::Error(causes) => put_chunk(buf, chunk_type, 0, causes),
            Self::CookieEcho(cookie) => put_chunk(buf, chunk_type, 0, cookie),
            Self::Unknown { flags, value, .. } => put_chunk(buf, chunk_type, *flags, value),
        }
    }

    fn decode(chunk_type: u8, flags: u8, mut value: Bytes) -> Result<Self, SctpError> {
        let short = |what: &str| SctpError::Malformed(format!("{} chunk too short", what));
        let chunk = match chunk_type {
            chunk_type::DATA => {
                if value.len() < 12 {
                    return Err(short("DATA"));
                }
                let tsn = value.get_u32();
                let stream_id = value.get_u16();
                let stream_seq = value.get_u16();
                let ppid = value.get_u32();
                Self::Data(DataChunk {
                    tsn,
                    stream_id,
                    stream_seq,
                    ppid,
                    user_data: value,
                    unordered: (flags & 0x04) != 0,
                    beginning: (flags & 0x02) != 0,
                    ending: (flags & 0x01) != 0,
                })
            }
            t @ (chunk_type::INIT | chunk_type::INIT_ACK) => {
                if value.len() < 16 {
                    return Err(short("INIT"));
                }
                let mut init = InitChunk {
                    initiate_tag: value.get_u32(),
                    a_rwnd: value.get_u32(),
                    outbound_streams: value.get_u16(),
                    inbound_streams: value.get_u16(),
                    initial_tsn: value.get_u32(),
                    cookie: None,
                };
                for (tag, param) in decode_params(value)? {
                    if tag == PARAM_STATE_COOKIE {
                        init.cookie = Some(param);
                    }
                }
                if t == chunk_type::INIT {
                    Self::Init(init)
                } else {
                    Self::InitAck(init)
                }
            }
            chunk_type::SACK => {
                if value.len() < 12 {
                    return Err(short("SACK"));
                }
                Self::Sack(SackChunk {
                    cumulative_tsn_ack: value.get_u32(),
                    a_rwnd: value.get_u32(),
                })
            }
            t @ (chunk_type::HEARTBEAT | chunk_type::HEARTBEAT_ACK) => {
                let info = decode_params(value)?
                    .into_iter()
                    .find(|(tag, _)| *tag == PARAM_HEARTBEAT_INFO)
                    .map(|(_, v)| v)
                    .ok_or_else(|| SctpError::Malformed("heartbeat without info".to_string()))?;
                if t == chunk_type::HEARTBEAT {
                    Self::Heartbeat(info)
                } else {
                    Self::HeartbeatAck(info)
                }
            }
            chunk_type::ABORT => Self::Abort {
                reflected: flags & 0x01 != 0,
            },
            chunk_type::SHUTDOWN => {
                if value.len() < 4 {
                    return Err(short("SHUTDOWN"));
                }
                Self::Shutdown {
                    cumulative_tsn_ack: value.get_u32(),
                }
            }
            chunk_type::SHUTDOWN_ACK => Self::ShutdownAck,
            chunk_type::ERROR => Self::Error(value),
            chunk_type::COOKIE_ECHO => Self::CookieEcho(value),
            chunk_type::COOKIE_ACK => Self::CookieAck,
            chunk_type::SHUTDOWN_COMPLETE => Self::ShutdownComplete {
                reflected: flags & 0x01 != 0,
            },
            _ => Self::Unknown {
                chunk_type,
                flags,
                value,
            },
        };
        Ok(chunk)
    }
}

fn decode_params(mut buf: Bytes) -> Result<Vec<(u16, Bytes)>, SctpError> {
    let mut params = Vec::new();
    while buf.remaining() >= 4 {
        let tag = buf.get_u16();
        let length = buf.get_u16() as usize;
        if length < 4 || length - 4 > buf.remaining() {
            return Err(SctpError::Malformed(format!(
                "parameter 0x{:04X} length {}",
                tag, length
            )));
        }
        params.push((tag, buf.split_to(length - 4)));
        let padding = ((4 - length % 4) % 4).min(buf.remaining());
        buf.advance(padding);
    }
    Ok(params)
}

/// A complete SCTP packet: common header plus bundled chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: SctpHeader,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    pub fn new(source_port: u16, destination_port: u16, verification_tag: u32) -> Self {
        Self {
            header: SctpHeader {
                source_port,
                destination_port,
                verification_tag,
            },
            chunks: Vec::new(),
        }
    }

    pub fn with_chunk(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Encode with the CRC32c filled in
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.header.source_port);
        buf.put_u16(self.header.destination_port);
        buf.put_u32(self.header.verification_tag);
        buf.put_u32(0);
        for chunk in &self.chunks {
            chunk.encode(&mut buf);
        }
        let crc = crc32c::checksum(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf.freeze()
    }

    /// Decode and verify the checksum
    pub fn decode(data: Bytes) -> Result<Self, SctpError> {
        if data.len() < SctpHeader::SIZE {
            return Err(SctpError::Malformed(format!(
                "packet of {} bytes shorter than common header",
                data.len()
            )));
        }
        let mut zeroed = BytesMut::from(&data[..]);
        let actual = (&data[8..12]).get_u32_le();
        zeroed[8..12].copy_from_slice(&[0; 4]);
        let expected = crc32c::checksum(&zeroed);
        if expected != actual {
            return Err(SctpError::Checksum { expected, actual });
        }

        let mut buf = data;
        let header = SctpHeader {
            source_port: buf.get_u16(),
            destination_port: buf.get_u16(),
            verification_tag: buf.get_u32(),
        };
        buf.advance(4);

        let mut chunks = Vec::new();
        while buf.remaining() >= 4 {
            let chunk_type = buf.get_u8();
            let flags = buf.get_u8();
            let length = buf.get_u16() as usize;
            if length < 4 || length - 4 > buf.remaining() {
                return Err(SctpError::Malformed(format!(
                    "chunk type {} length {}",
                    chunk_type, length
                )));
            }
            let value = buf.split_to(length - 4);
            let padding = ((4 - length % 4) % 4).min(buf.remaining());
            buf.advance(padding);
            chunks.push(Chunk::decode(chunk_type, flags, value)?);
        }
        if buf.has_remaining() {
            return Err(SctpError::Malformed("trailing bytes after chunks".to_string()));
        }
        Ok(Self { header, chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::new(2905, 2905, 0xDEAD_BEEF)
            .with_chunk(Chunk::Data(DataChunk::new(
                7,
                1,
                3,
                crate::sctp::PPID_M3UA,
                Bytes::from_static(b"hello"),
            )))
            .with_chunk(Chunk::Sack(SackChunk {
                cumulative_tsn_ack: 41,
                a_rwnd: 65535,
            }))
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = sample();
        let decoded = Packet::decode(packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_data_padding() {
        let encoded = sample().encode();
        // 12 header + 16 DATA header + 5 data + 3 pad + 16 SACK
        assert_eq!(encoded.len(), 12 + 24 + 16);
    }

    #[test]
    fn test_init_ack_carries_cookie() {
        let init = InitChunk {
            initiate_tag: 0x1234,
            a_rwnd: 65535,
            outbound_streams: 2,
            inbound_streams: 2,
            initial_tsn: 100,
            cookie: Some(Bytes::from_static(&[1, 2, 3, 4, 5, 6])),
        };
        let packet = Packet::new(1, 2, 9).with_chunk(Chunk::InitAck(init.clone()));
        let decoded = Packet::decode(packet.encode()).unwrap();
        assert_eq!(decoded.chunks, vec![Chunk::InitAck(init)]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut raw = BytesMut::from(&sample().encode()[..]);
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(matches!(
            Packet::decode(raw.freeze()),
            Err(SctpError::Checksum { .. })
        ));
    }

    #[test]
    fn test_unknown_chunk_kept() {
        let packet = Packet::new(1, 2, 3).with_chunk(Chunk::Unknown {
            chunk_type: 0xC0,
            flags: 0,
            value: Bytes::from_static(&[9, 9]),
        });
        let decoded = Packet::decode(packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_short_packet() {
        assert!(matches!(
            Packet::decode(Bytes::from_static(&[0; 4])),
            Err(SctpError::Malformed(_))
        ));
    }
}
