use cipher_relay_cipher::CipherError;
use cipher_relay_peer::PeerError;
use cipher_relay_transport::TransportError;

/// Errors raised by the remote relay.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Listener bind failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Relay connection failure.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// Key derivation failure at startup.
    #[error("key setup failed: {0}")]
    Cipher(#[from] CipherError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;
