//! Frame kinds.
//!
//! OPEN, DATA, CLOSE and ACK address a logical stream (id >= 1).
//! PING is connection-level and always travels on stream id 0.

use std::fmt;

/// The kind byte at the start of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Request a new logical stream. Payload: destination address.
    Open = 0x01,
    /// Stream payload bytes.
    Data = 0x02,
    /// Close (or refuse) a stream. Payload: reason byte.
    Close = 0x03,
    /// Confirm an OPEN and/or grant send-window credit. Payload: credit.
    Ack = 0x04,
    /// Connection keepalive. Payload: request/reply flag.
    Ping = 0x05,
}

impl FrameKind {
    /// Parse a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameKind::Open),
            0x02 => Some(FrameKind::Data),
            0x03 => Some(FrameKind::Close),
            0x04 => Some(FrameKind::Ack),
            0x05 => Some(FrameKind::Ping),
            _ => None,
        }
    }

    /// The wire byte for this kind.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns a human-readable name for the kind.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Open => "OPEN",
            FrameKind::Data => "DATA",
            FrameKind::Close => "CLOSE",
            FrameKind::Ack => "ACK",
            FrameKind::Ping => "PING",
        }
    }

    /// Returns true if the kind belongs to the connection rather than a stream.
    pub fn is_connection_level(self) -> bool {
        self == FrameKind::Ping
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
