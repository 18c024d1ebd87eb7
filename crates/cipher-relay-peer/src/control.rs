//! Control payloads carried inside OPEN, CLOSE, ACK and PING frames.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PeerError, Result};

/// Address type: IPv4.
pub const ATYP_IPV4: u8 = 0x01;
/// Address type: domain name.
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6.
pub const ATYP_IPV6: u8 = 0x04;

/// PING payload flag: request.
pub const PING_REQUEST: u8 = 0x00;
/// PING payload flag: reply.
pub const PING_REPLY: u8 = 0x01;

/// Where a relayed stream should connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Destination {
    pub fn host(&self) -> String {
        match self {
            Destination::Ip(addr) => addr.ip().to_string(),
            Destination::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Destination::Ip(addr) => addr.port(),
            Destination::Domain(_, port) => *port,
        }
    }

    /// Encode as `atyp | addr | port(BE)`.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Destination::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            Destination::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            Destination::Domain(host, _) => {
                if host.is_empty() || host.len() > 255 {
                    return Err(PeerError::MalformedFrame(format!(
                        "domain length {} out of range",
                        host.len()
                    )));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(host.len() as u8);
                buf.put_slice(host.as_bytes());
            }
        }
        buf.put_u16(self.port());
        Ok(buf.freeze())
    }

    /// Decode an OPEN payload. Trailing bytes are rejected.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (&atyp, rest) = payload
            .split_first()
            .ok_or_else(|| PeerError::MalformedFrame("empty address payload".to_string()))?;

        let (dest, used) = match atyp {
            ATYP_IPV4 => {
                let bytes = take(rest, 6, "IPv4 address")?;
                let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                let port = u16::from_be_bytes([bytes[4], bytes[5]]);
                (Destination::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 6)
            }
            ATYP_IPV6 => {
                let bytes = take(rest, 18, "IPv6 address")?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[..16]);
                let port = u16::from_be_bytes([bytes[16], bytes[17]]);
                (
                    Destination::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    18,
                )
            }
            ATYP_DOMAIN => {
                let len = take(rest, 1, "domain length")?[0] as usize;
                if len == 0 {
                    return Err(PeerError::MalformedFrame("empty domain".to_string()));
                }
                let bytes = take(rest, 1 + len + 2, "domain address")?;
                let host = std::str::from_utf8(&bytes[1..1 + len])
                    .map_err(|_| PeerError::MalformedFrame("domain is not utf-8".to_string()))?;
                let port = u16::from_be_bytes([bytes[1 + len], bytes[2 + len]]);
                (Destination::Domain(host.to_string(), port), 1 + len + 2)
            }
            other => {
                return Err(PeerError::MalformedFrame(format!(
                    "unknown address type 0x{other:02x}"
                )))
            }
        };

        if rest.len() != used {
            return Err(PeerError::MalformedFrame(format!(
                "{} trailing bytes after address",
                rest.len() - used
            )));
        }
        Ok(dest)
    }
}

fn take<'a>(buf: &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    buf.get(..len)
        .ok_or_else(|| PeerError::MalformedFrame(format!("{what} truncated")))
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Ip(addr) => write!(f, "{addr}"),
            Destination::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Why a stream is being closed. Carried as the single CLOSE payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Graceful end of the sender's direction. The other direction stays open.
    Normal,
    /// The responder could not reach the destination.
    Refused,
    /// An open or dial did not complete in time.
    Timeout,
    /// The stream was torn down abruptly.
    Reset,
    /// The connection carrying the stream is gone.
    PeerUnreachable,
}

impl CloseReason {
    pub fn as_u8(self) -> u8 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::Refused => 1,
            CloseReason::Timeout => 2,
            CloseReason::Reset => 3,
            CloseReason::PeerUnreachable => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CloseReason::Normal),
            1 => Some(CloseReason::Refused),
            2 => Some(CloseReason::Timeout),
            3 => Some(CloseReason::Reset),
            4 => Some(CloseReason::PeerUnreachable),
            _ => None,
        }
    }

    /// Non-normal reasons abort both directions at once.
    pub fn is_abort(self) -> bool {
        self != CloseReason::Normal
    }

    pub fn encode(self) -> Bytes {
        Bytes::copy_from_slice(&[self.as_u8()])
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [byte] => CloseReason::from_u8(*byte).ok_or_else(|| {
                PeerError::MalformedFrame(format!("unknown close reason {byte}"))
            }),
            _ => Err(PeerError::MalformedFrame(format!(
                "close payload must be 1 byte, got {}",
                payload.len()
            ))),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Normal => "normal",
            CloseReason::Refused => "refused",
            CloseReason::Timeout => "timeout",
            CloseReason::Reset => "reset",
            CloseReason::PeerUnreachable => "peer unreachable",
        };
        f.write_str(name)
    }
}

/// Encode an ACK credit.
pub fn encode_credit(credit: u32) -> Bytes {
    Bytes::copy_from_slice(&credit.to_be_bytes())
}

/// Decode an ACK credit.
pub fn decode_credit(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| {
        PeerError::MalformedFrame(format!(
            "ack payload must be 4 bytes, got {}",
            payload.len()
        ))
    })?;
    Ok(u32::from_be_bytes(bytes))
}
