//! Key material.
//!
//! ```text
//! secret ──HKDF(salt="cipher-relay/v1")──┬─ info "master" ─> master key
//!                                        └─ info "auth"   ─> auth key
//!
//! master key ──HKDF(salt=client_random|server_random)──┬─ "c2s" ─> client->server key
//!                                                      └─ "s2c" ─> server->client key
//! ```

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CipherError, Result};

/// Size of an AEAD key.
pub const KEY_SIZE: usize = 32;

/// Size of each handshake random.
pub const RANDOM_SIZE: usize = 32;

/// Size of a handshake proof (HMAC-SHA256 output).
pub const PROOF_SIZE: usize = 32;

const ROOT_SALT: &[u8] = b"cipher-relay/v1";

type HmacSha256 = Hmac<Sha256>;

/// The configured pre-shared secret.
///
/// Never printed: `Debug` shows only the length.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SharedSecret {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for SharedSecret {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted:{} bytes>", self.0.len())
    }
}

/// Long-lived keys derived from the shared secret.
///
/// Derived once at startup and shared by every connection of the process.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    master: [u8; KEY_SIZE],
    auth: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Derive the master and authentication keys from `secret`.
    pub fn derive(secret: &SharedSecret) -> Result<Self> {
        if secret.is_empty() {
            return Err(CipherError::EmptySecret);
        }
        let hkdf = Hkdf::<Sha256>::new(Some(ROOT_SALT), secret.as_bytes());

        let mut master = [0u8; KEY_SIZE];
        let mut auth = [0u8; KEY_SIZE];
        hkdf.expand(b"master", &mut master)
            .map_err(|_| CipherError::Kdf("master key expansion"))?;
        hkdf.expand(b"auth", &mut auth)
            .map_err(|_| CipherError::Kdf("auth key expansion"))?;

        Ok(Self { master, auth })
    }

    /// Compute the handshake proof for `label` over both randoms.
    pub fn proof(
        &self,
        label: &[u8],
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
    ) -> Result<[u8; PROOF_SIZE]> {
        let mac = self.proof_mac(label, client_random, server_random)?;
        let mut out = [0u8; PROOF_SIZE];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    /// Verify a peer's handshake proof in constant time.
    pub fn verify_proof(
        &self,
        label: &[u8],
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
        proof: &[u8],
    ) -> Result<()> {
        let mac = self.proof_mac(label, client_random, server_random)?;
        mac.verify_slice(proof)
            .map_err(|_| CipherError::AuthenticationFailure)
    }

    fn proof_mac(
        &self,
        label: &[u8],
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
    ) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.auth)
            .map_err(|_| CipherError::Kdf("hmac key length"))?;
        mac.update(label);
        mac.update(client_random);
        mac.update(server_random);
        Ok(mac)
    }

    /// Derive the directional keys for one connection.
    pub fn session_keys(
        &self,
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
    ) -> Result<SessionKeys> {
        let mut salt = [0u8; RANDOM_SIZE * 2];
        salt[..RANDOM_SIZE].copy_from_slice(client_random);
        salt[RANDOM_SIZE..].copy_from_slice(server_random);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &self.master);
        let mut keys = SessionKeys {
            client_to_server: [0u8; KEY_SIZE],
            server_to_client: [0u8; KEY_SIZE],
        };
        hkdf.expand(b"c2s", &mut keys.client_to_server)
            .map_err(|_| CipherError::Kdf("c2s key expansion"))?;
        hkdf.expand(b"s2c", &mut keys.server_to_client)
            .map_err(|_| CipherError::Kdf("s2c key expansion"))?;
        Ok(keys)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey(<redacted:{} bytes>)", KEY_SIZE * 2)
    }
}

/// Per-connection directional keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub(crate) client_to_server: [u8; KEY_SIZE],
    pub(crate) server_to_client: [u8; KEY_SIZE],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKeys(<redacted:{} bytes>)", KEY_SIZE * 2)
    }
}

/// Fresh handshake random from the OS entropy source.
pub fn handshake_random() -> [u8; RANDOM_SIZE] {
    let mut buf = [0u8; RANDOM_SIZE];
    OsRng.fill_bytes(&mut buf);
    buf
}
