use crate::kind::FrameKind;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header carries a kind byte this codec does not know.
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Stream id 0 is reserved for PING and PING must use stream id 0.
    #[error("{kind} frame with invalid stream id {stream_id}")]
    InvalidStreamId { kind: FrameKind, stream_id: u32 },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for protocol violations (as opposed to I/O or EOF conditions).
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameError::UnknownKind(_)
                | FrameError::PayloadTooLarge { .. }
                | FrameError::InvalidStreamId { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
