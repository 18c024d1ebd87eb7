//! Authenticated encryption for relay connections.
//!
//! A [`MasterKey`] is derived once from the configured shared secret. Each
//! transport connection then derives its own directional keys from the master
//! key and the two handshake randoms, and wraps them in a [`CipherSession`].
//!
//! Payloads are sealed with ChaCha20-Poly1305. Nonces are never transmitted:
//! both ends track a per-direction counter and build the same nonce from it.

pub mod error;
pub mod key;
pub mod nonce;
pub mod session;

pub use error::{CipherError, Result};
pub use key::{
    handshake_random, MasterKey, SessionKeys, SharedSecret, KEY_SIZE, PROOF_SIZE, RANDOM_SIZE,
};
pub use nonce::{construct_nonce, Direction, NONCE_SIZE};
pub use session::{CipherSession, Opener, Role, Sealer, TAG_SIZE};
