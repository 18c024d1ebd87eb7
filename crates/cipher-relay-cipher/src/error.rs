/// Errors from key derivation and AEAD operations.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Integrity check failed: wrong key, tampered bytes or out-of-order counter.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The direction counter has reached its limit; the key must not be used again.
    #[error("nonce counter exhausted")]
    NonceExhausted,

    /// Key derivation produced an error.
    #[error("key derivation failed: {0}")]
    Kdf(&'static str),

    /// The configured secret is empty.
    #[error("shared secret must not be empty")]
    EmptySecret,
}

pub type Result<T> = std::result::Result<T, CipherError>;
