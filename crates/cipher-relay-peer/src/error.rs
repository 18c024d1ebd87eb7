use std::sync::Arc;
use std::time::Duration;

use cipher_relay_cipher::CipherError;
use cipher_relay_frame::FrameError;
use cipher_relay_transport::TransportError;

use crate::control::CloseReason;

/// Errors that can occur on a relay connection or one of its streams.
///
/// Cloneable so one connection failure can be delivered to every stream and
/// every waiter that depended on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerError {
    /// The peer violated the framing or control protocol.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A sealed payload or handshake proof failed verification.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The socket to the remote relay could not be established.
    #[error("connect failed: {0}")]
    Connect(#[source] Arc<TransportError>),

    /// The transport connection died (reset, EOF or keepalive timeout).
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The remote did not acknowledge an OPEN in time.
    #[error("stream open timed out after {0:?}")]
    OpenTimeout(Duration),

    /// The stream's send window is zero. A backpressure signal.
    #[error("send window exhausted on stream {0}")]
    WindowExhausted(u32),

    /// No transport connection can take another stream.
    #[error("no transport connection available: {0}")]
    ConnectionUnavailable(String),

    /// The remote refused to open the stream.
    #[error("remote refused stream {stream_id} ({reason})")]
    RemoteRefused { stream_id: u32, reason: CloseReason },

    /// The stream was aborted or is already closed.
    #[error("stream {0} closed")]
    StreamClosed(u32),

    /// The transport connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The handshake did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Socket I/O error.
    #[error("io error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Cipher error other than an authentication failure.
    #[error("cipher error: {0}")]
    Cipher(#[source] Arc<CipherError>),
}

impl PeerError {
    /// True if the error ends the whole transport connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            PeerError::MalformedFrame(_)
                | PeerError::AuthenticationFailure
                | PeerError::HandshakeFailed(_)
                | PeerError::Cipher(_)
        )
    }

    /// True if a caller may reasonably retry on a fresh connection.
    ///
    /// Authentication failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PeerError::Connect(_)
                | PeerError::PeerUnreachable(_)
                | PeerError::ConnectionUnavailable(_)
                | PeerError::ConnectionClosed
        )
    }
}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Io(Arc::new(err))
    }
}

impl From<TransportError> for PeerError {
    fn from(err: TransportError) -> Self {
        PeerError::Connect(Arc::new(err))
    }
}

impl From<CipherError> for PeerError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::AuthenticationFailure => PeerError::AuthenticationFailure,
            other => PeerError::Cipher(Arc::new(other)),
        }
    }
}

impl From<FrameError> for PeerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => PeerError::Io(Arc::new(io)),
            FrameError::ConnectionClosed => {
                PeerError::PeerUnreachable("connection closed mid-frame".to_string())
            }
            malformed => PeerError::MalformedFrame(malformed.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_auth_failure_maps_to_authentication_failure() {
        let err: PeerError = CipherError::AuthenticationFailure.into();
        assert!(matches!(err, PeerError::AuthenticationFailure));
        assert!(err.is_connection_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn frame_errors_map_by_kind() {
        let err: PeerError = FrameError::UnknownKind(0x42).into();
        assert!(matches!(err, PeerError::MalformedFrame(_)));

        let err: PeerError = FrameError::ConnectionClosed.into();
        assert!(matches!(err, PeerError::PeerUnreachable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn stream_level_errors_are_not_fatal() {
        for err in [
            PeerError::OpenTimeout(Duration::from_secs(1)),
            PeerError::WindowExhausted(1),
            PeerError::StreamClosed(3),
            PeerError::RemoteRefused {
                stream_id: 1,
                reason: CloseReason::Refused,
            },
        ] {
            assert!(!err.is_connection_fatal(), "{err}");
        }
    }
}
