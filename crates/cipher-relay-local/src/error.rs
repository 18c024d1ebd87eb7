use cipher_relay_cipher::CipherError;
use cipher_relay_peer::PeerError;
use cipher_relay_transport::TransportError;

/// Errors raised by the local proxy.
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    /// Listener bind or accept failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Relay connection or stream failure.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// Key derivation failure at startup.
    #[error("key setup failed: {0}")]
    Cipher(#[from] CipherError),

    /// Client socket I/O error.
    #[error("client io error: {0}")]
    Io(#[from] std::io::Error),

    /// The client spoke something other than the expected proxy protocol.
    #[error("malformed proxy handshake: {0}")]
    Protocol(String),

    /// The client speaks an unsupported SOCKS version.
    #[error("unsupported SOCKS version {0}")]
    UnsupportedVersion(u8),

    /// No acceptable SOCKS5 authentication method was offered.
    #[error("no acceptable SOCKS5 authentication method")]
    UnsupportedAuth,

    /// SOCKS5 username/password did not match.
    #[error("SOCKS5 authentication failed")]
    AuthFailed,

    /// SOCKS5 command other than CONNECT.
    #[error("SOCKS5 command 0x{0:02x} not supported")]
    CommandNotSupported(u8),

    /// SOCKS5 address type not recognised.
    #[error("SOCKS5 address type 0x{0:02x} not supported")]
    AddressTypeNotSupported(u8),

    /// The client did not finish its handshake in time.
    #[error("client handshake timed out")]
    HandshakeTimeout,

    /// The concurrent stream cap is reached.
    #[error("admission rejected: {limit} streams already open")]
    AdmissionRejected { limit: usize },

    /// The proxy is shutting down.
    #[error("proxy is shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LocalError>;
