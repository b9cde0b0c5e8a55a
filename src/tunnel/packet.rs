//! Wire packets and the length-prefixed codec.
//!
//! Frame format:
//! ```text
//! +-------------+---------+-------------+------------------+
//! | Length (4B) | Cmd(1B) |   Id (8B)   |       Body       |
//! +-------------+---------+-------------+------------------+
//! ```
//! Length counts everything after the length field, big-endian. Bodies:
//! - `Connect`: presence flag (1B), then network and host as u16-prefixed
//!   strings and a u16 port
//! - `Data`: raw payload bytes
//! - `Close`: empty
//! - `Register`: u16 domain count, then u16-prefixed strings

use super::{TunnelError, MAX_FRAME_SIZE};
use crate::net::Location;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CMD_CONNECT: u8 = 1;
const CMD_DATA: u8 = 2;
const CMD_CLOSE: u8 = 3;
const CMD_REGISTER: u8 = 4;

/// Header size after the length prefix: command (1) + id (8).
const HEADER_SIZE: usize = 9;

/// Size of the length prefix itself.
const LEN_SIZE: usize = 4;

/// A protocol packet: common `(command, id)` header plus a
/// command-specific body.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Open stream `id` to `loc`. A missing location is representable so
    /// the receiving loop can drop the violating frame instead of failing
    /// the whole link.
    Connect { id: u64, loc: Option<Location> },
    /// Payload bytes for stream `id`.
    Data { id: u64, data: Bytes },
    /// Stream `id` is closed at the sender.
    Close { id: u64 },
    /// The sender advertises reachability of these domains.
    Register { domains: Vec<String> },
}

impl Packet {
    /// Stream ID this packet addresses; 0 for link-level packets.
    pub fn id(&self) -> u64 {
        match self {
            Packet::Connect { id, .. } | Packet::Data { id, .. } | Packet::Close { id } => *id,
            Packet::Register { .. } => 0,
        }
    }

    fn command(&self) -> u8 {
        match self {
            Packet::Connect { .. } => CMD_CONNECT,
            Packet::Data { .. } => CMD_DATA,
            Packet::Close { .. } => CMD_CLOSE,
            Packet::Register { .. } => CMD_REGISTER,
        }
    }
}

/// Length-prefixed packet codec.
#[derive(Debug, Default)]
pub struct PacketCodec;

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), TunnelError> {
    if s.len() > u16::MAX as usize {
        return Err(TunnelError::InvalidFrame(format!(
            "string too long: {} bytes",
            s.len()
        )));
    }
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn get_string(src: &mut Bytes) -> Result<String, TunnelError> {
    if src.remaining() < 2 {
        return Err(TunnelError::InvalidFrame("truncated string length".into()));
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(TunnelError::InvalidFrame("truncated string".into()));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| TunnelError::InvalidFrame("string is not utf-8".into()))
}

impl Encoder<Packet> for PacketCodec {
    type Error = TunnelError;

    fn encode(&mut self, pkt: Packet, dst: &mut BytesMut) -> Result<(), TunnelError> {
        let mut body = BytesMut::new();
        match &pkt {
            Packet::Connect { loc, .. } => match loc {
                Some(loc) => {
                    body.put_u8(1);
                    put_string(&mut body, &loc.network)?;
                    put_string(&mut body, &loc.host)?;
                    body.put_u16(loc.port);
                }
                None => body.put_u8(0),
            },
            Packet::Data { data, .. } => body.put_slice(data),
            Packet::Close { .. } => {}
            Packet::Register { domains } => {
                if domains.len() > u16::MAX as usize {
                    return Err(TunnelError::InvalidFrame(format!(
                        "too many domains: {}",
                        domains.len()
                    )));
                }
                body.put_u16(domains.len() as u16);
                for domain in domains {
                    put_string(&mut body, domain)?;
                }
            }
        }

        let frame_len = HEADER_SIZE + body.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(TunnelError::FrameTooLarge(frame_len, MAX_FRAME_SIZE));
        }

        dst.reserve(LEN_SIZE + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u8(pkt.command());
        dst.put_u64(pkt.id());
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, TunnelError> {
        if src.len() < LEN_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes(src[0..LEN_SIZE].try_into().unwrap()) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(TunnelError::FrameTooLarge(frame_len, MAX_FRAME_SIZE));
        }
        if frame_len < HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "frame shorter than header: {} bytes",
                frame_len
            )));
        }

        if src.len() < LEN_SIZE + frame_len {
            src.reserve(LEN_SIZE + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_SIZE);
        let mut frame = src.split_to(frame_len).freeze();

        let command = frame.get_u8();
        let id = frame.get_u64();

        let pkt = match command {
            CMD_CONNECT => {
                if frame.remaining() < 1 {
                    return Err(TunnelError::InvalidFrame("connect body missing".into()));
                }
                let loc = if frame.get_u8() == 0 {
                    None
                } else {
                    let network = get_string(&mut frame)?;
                    let host = get_string(&mut frame)?;
                    if frame.remaining() < 2 {
                        return Err(TunnelError::InvalidFrame("connect missing port".into()));
                    }
                    let port = frame.get_u16();
                    Some(Location { network, host, port })
                };
                Packet::Connect { id, loc }
            }
            CMD_DATA => Packet::Data { id, data: frame },
            CMD_CLOSE => Packet::Close { id },
            CMD_REGISTER => {
                if frame.remaining() < 2 {
                    return Err(TunnelError::InvalidFrame("register body missing".into()));
                }
                let count = frame.get_u16() as usize;
                let mut domains = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    domains.push(get_string(&mut frame)?);
                }
                Packet::Register { domains }
            }
            other => {
                return Err(TunnelError::InvalidFrame(format!(
                    "unknown command: {}",
                    other
                )))
            }
        };

        Ok(Some(pkt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pkt: Packet) -> Packet {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(pkt, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_connect_roundtrip() {
        let pkt = Packet::Connect {
            id: 42,
            loc: Some(Location::tcp("svc.local", 8080)),
        };
        assert_eq!(roundtrip(pkt.clone()), pkt);
    }

    #[test]
    fn test_connect_without_location() {
        let pkt = Packet::Connect { id: 7, loc: None };
        assert_eq!(roundtrip(pkt.clone()), pkt);
    }

    #[test]
    fn test_data_roundtrip() {
        let pkt = Packet::Data {
            id: 9,
            data: Bytes::from_static(b"hello tunnel"),
        };
        assert_eq!(roundtrip(pkt.clone()), pkt);
    }

    #[test]
    fn test_close_roundtrip() {
        let pkt = Packet::Close { id: u64::MAX };
        assert_eq!(roundtrip(pkt.clone()), pkt);
    }

    #[test]
    fn test_register_roundtrip() {
        let pkt = Packet::Register {
            domains: vec!["a.example".into(), "b.example".into()],
        };
        assert_eq!(roundtrip(pkt.clone()), pkt);

        let empty = Packet::Register { domains: vec![] };
        assert_eq!(roundtrip(empty.clone()), empty);
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Packet::Data {
                    id: 1,
                    data: Bytes::from_static(b"payload"),
                },
                &mut buf,
            )
            .unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Not even a full length prefix
        let mut tiny = BytesMut::from(&buf[..2]);
        assert!(codec.decode(&mut tiny).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(TunnelError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(HEADER_SIZE as u32);
        buf.put_u8(0xEE);
        buf.put_u64(1);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(TunnelError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_multiple_packets_in_buffer() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(Packet::Close { id: 1 }, &mut buf).unwrap();
        codec
            .encode(
                Packet::Data {
                    id: 2,
                    data: Bytes::from_static(b"x"),
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Packet::Close { id: 1 });
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Packet::Data {
                id: 2,
                data: Bytes::from_static(b"x")
            }
        );
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
