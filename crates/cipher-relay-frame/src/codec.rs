use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

/// Frame header: kind (1) + stream id (4) + length (4) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

/// Default maximum payload size accepted by the codec: 64 KiB.
///
/// This bounds what a peer can make us buffer before a frame is complete.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Logical stream identifier.
pub type StreamId = u32;

/// A framed unit of relay traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the frame carries.
    pub kind: FrameKind,
    /// The logical stream this frame belongs to (0 for PING).
    pub stream_id: StreamId,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream_id,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// The `kind | stream_id` prefix of the header.
    ///
    /// Used as associated data when the payload is sealed, so a sealed payload
    /// cannot be replayed under another kind or stream.
    pub fn routing_header(&self) -> [u8; 5] {
        routing_header(self.kind, self.stream_id)
    }

    /// Check the stream id rule: 0 for PING, non-zero for everything else.
    pub fn validate(&self) -> Result<()> {
        validate_stream_id(self.kind, self.stream_id)
    }
}

/// Build the `kind | stream_id` header prefix.
pub fn routing_header(kind: FrameKind, stream_id: StreamId) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = kind.as_u8();
    out[1..5].copy_from_slice(&stream_id.to_be_bytes());
    out
}

fn validate_stream_id(kind: FrameKind, stream_id: StreamId) -> Result<()> {
    if kind.is_connection_level() != (stream_id == 0) {
        return Err(FrameError::InvalidStreamId { kind, stream_id });
    }
    Ok(())
}

/// Encode a frame into the wire format.
///
/// Layout: `kind(1) | stream_id(4, BE) | length(4, BE) | payload(length)`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    frame.validate()?;
    if frame.payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(frame.wire_size());
    dst.put_u8(frame.kind.as_u8());
    dst.put_u32(frame.stream_id);
    dst.put_u32(frame.payload.len() as u32);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Encode a single frame into a fresh buffer.
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(frame.wire_size());
    encode_frame(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Take one frame off the front of `src`.
///
/// `Ok(None)` means more bytes are needed and nothing was consumed. Header violations are
/// reported as soon as the header is complete, without waiting for the payload.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let kind = FrameKind::from_u8(src[0]).ok_or(FrameError::UnknownKind(src[0]))?;
    let stream_id = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
    let payload_len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;

    validate_stream_id(kind, stream_id)?;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        kind,
        stream_id,
        payload,
    }))
}

/// Codec limits.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 64 KiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
