//! Encrypted, multiplexed relay for local SOCKS5 and HTTP proxy traffic.
//!
//! A local relay accepts proxy clients and carries each client connection as
//! a logical stream over a few authenticated, encrypted TCP connections to a
//! remote relay, which dials the real destinations.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP bind, accept and bounded-time connect
//! - [`frame`]: length-prefixed wire frames
//! - [`cipher`]: key derivation and per-connection AEAD sessions
//! - [`peer`]: handshake, transport connections, pooling and stream multiplexing
//! - [`local`]: SOCKS5/HTTP front-end and session supervisor (behind `local` feature)
//! - [`remote`]: remote relay endpoint (behind `remote` feature)

/// Re-export transport types.
pub mod transport {
    pub use cipher_relay_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use cipher_relay_frame::*;
}

/// Re-export cipher types.
pub mod cipher {
    pub use cipher_relay_cipher::*;
}

/// Re-export peer types.
pub mod peer {
    pub use cipher_relay_peer::*;
}

/// Re-export the local relay (requires `local` feature).
#[cfg(feature = "local")]
pub mod local {
    pub use cipher_relay_local::*;
}

/// Re-export the remote relay (requires `remote` feature).
#[cfg(feature = "remote")]
pub mod remote {
    pub use cipher_relay_remote::*;
}
