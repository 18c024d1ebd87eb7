//! Length-prefixed relay frames with per-stream routing.
//!
//! Every unit on a relay connection is framed with:
//! - A 1-byte frame kind (OPEN, DATA, CLOSE, ACK, PING)
//! - A 4-byte big-endian logical stream id (0 only for PING)
//! - A 4-byte big-endian payload length
//!
//! The codec never looks inside payloads. On the wire they are sealed by the
//! cipher layer; after opening they are plaintext. Either way the framing is
//! identical.

pub mod codec;
pub mod error;
pub mod framed;
pub mod kind;

pub use codec::{
    decode_frame, encode, encode_frame, Frame, FrameConfig, StreamId, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use framed::FrameCodec;
pub use kind::FrameKind;
