use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{CipherError, Result};
use crate::key::SessionKeys;
use crate::nonce::{construct_nonce, Direction};

/// Poly1305 tag appended to every sealed payload.
pub const TAG_SIZE: usize = 16;

/// Which end of the transport connection this session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The local relay, which dialed the connection.
    Client,
    /// The remote relay, which accepted it.
    Server,
}

impl Role {
    fn send_direction(self) -> Direction {
        match self {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        }
    }
}

/// Sending half: seals outbound payloads.
///
/// Holds the only copy of the send counter, so whoever owns the `Sealer` is
/// the single writer for that direction.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    direction: Direction,
    counter: u64,
}

impl Sealer {
    fn new(key: &[u8], direction: Direction) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            direction,
            counter: 0,
        }
    }

    /// Encrypt `plaintext`, binding `aad`. Advances the counter by one.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(CipherError::NonceExhausted);
        }
        let nonce = construct_nonce(self.direction, self.counter);
        self.counter += 1;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CipherError::AuthenticationFailure)
    }

    /// The counter the next `seal` will use.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer")
            .field("direction", &self.direction)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Receiving half: verifies and decrypts inbound payloads.
pub struct Opener {
    cipher: ChaCha20Poly1305,
    direction: Direction,
    counter: u64,
}

impl Opener {
    fn new(key: &[u8], direction: Direction) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            direction,
            counter: 0,
        }
    }

    /// Verify and decrypt `ciphertext`. Advances the counter by one.
    ///
    /// No plaintext is returned unless the tag verifies. Any failure leaves the
    /// session unusable, since the peer's counter has moved on.
    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(CipherError::NonceExhausted);
        }
        let nonce = construct_nonce(self.direction, self.counter);
        self.counter += 1;
        if ciphertext.len() < TAG_SIZE {
            return Err(CipherError::AuthenticationFailure);
        }
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CipherError::AuthenticationFailure)
    }

    /// The counter the next `open` expects.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl fmt::Debug for Opener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opener")
            .field("direction", &self.direction)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Authenticated-encryption state for one transport connection.
#[derive(Debug)]
pub struct CipherSession {
    sealer: Sealer,
    opener: Opener,
}

impl CipherSession {
    /// Build the session for `role` from the connection's keys.
    pub fn new(keys: &SessionKeys, role: Role) -> Self {
        let send = role.send_direction();
        let (send_key, recv_key) = match role {
            Role::Client => (&keys.client_to_server, &keys.server_to_client),
            Role::Server => (&keys.server_to_client, &keys.client_to_server),
        };
        Self {
            sealer: Sealer::new(send_key, send),
            opener: Opener::new(recv_key, send.opposite()),
        }
    }

    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.sealer.seal(aad, plaintext)
    }

    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.opener.open(aad, ciphertext)
    }

    /// Split into independently owned halves for separate reader/writer tasks.
    pub fn into_split(self) -> (Sealer, Opener) {
        (self.sealer, self.opener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::MasterKey;

    fn pair() -> (CipherSession, CipherSession) {
        let master = MasterKey::derive(&"test secret".into()).unwrap();
        let keys = master.session_keys(&[7; 32], &[9; 32]).unwrap();
        (
            CipherSession::new(&keys, Role::Client),
            CipherSession::new(&keys, Role::Server),
        )
    }

    #[test]
    fn seal_open_roundtrip() {
        let (mut client, mut server) = pair();
        let messages: [&[u8]; 4] = [b"", b"x", b"hello over the relay", &[0u8; 4096]];
        for msg in messages {
            let sealed = client.seal(b"aad", msg).unwrap();
            assert_eq!(sealed.len(), msg.len() + TAG_SIZE);
            assert_eq!(server.open(b"aad", &sealed).unwrap(), msg);
        }

        let reply = server.seal(b"", b"pong").unwrap();
        assert_eq!(client.open(b"", &reply).unwrap(), b"pong");
    }

    #[test]
    fn any_single_byte_flip_fails() {
        let plaintext = b"integrity matters";
        let (mut client, _) = pair();
        let sealed = client.seal(b"hdr", plaintext).unwrap();

        for i in 0..sealed.len() {
            let (_, mut server) = pair();
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(
                    server.open(b"hdr", &tampered),
                    Err(CipherError::AuthenticationFailure)
                ),
                "flip at byte {i} was not detected"
            );
        }
    }

    #[test]
    fn wrong_aad_fails() {
        let (mut client, mut server) = pair();
        let sealed = client.seal(&[0x02, 0, 0, 0, 1], b"data").unwrap();
        assert!(matches!(
            server.open(&[0x02, 0, 0, 0, 2], &sealed),
            Err(CipherError::AuthenticationFailure)
        ));
    }

    #[test]
    fn counters_strictly_increase() {
        let (mut client, mut server) = pair();
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.push(client.sealer.counter());
            let sealed = client.seal(b"", b"tick").unwrap();
            server.open(b"", &sealed).unwrap();
        }
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(client.sealer.counter(), 100);
        assert_eq!(server.opener.counter(), 100);
    }

    #[test]
    fn replayed_payload_rejected() {
        let (mut client, mut server) = pair();
        let first = client.seal(b"", b"once").unwrap();
        server.open(b"", &first).unwrap();
        assert!(matches!(
            server.open(b"", &first),
            Err(CipherError::AuthenticationFailure)
        ));
    }

    #[test]
    fn reflected_payload_rejected() {
        let (mut client, _) = pair();
        let sealed = client.seal(b"", b"echo").unwrap();
        // A payload bounced back at its sender uses the wrong direction key.
        assert!(client.open(b"", &sealed).is_err());
    }

    #[test]
    fn short_ciphertext_rejected() {
        let (_, mut server) = pair();
        assert!(matches!(
            server.open(b"", &[0u8; TAG_SIZE - 1]),
            Err(CipherError::AuthenticationFailure)
        ));
    }

    #[test]
    fn exhausted_counter_refuses_to_seal() {
        let (client, _) = pair();
        let (mut sealer, _) = client.into_split();
        sealer.counter = u64::MAX;
        assert!(matches!(
            sealer.seal(b"", b"no"),
            Err(CipherError::NonceExhausted)
        ));
        assert_eq!(sealer.counter(), u64::MAX);
    }

    #[test]
    fn split_halves_interoperate() {
        let (client, server) = pair();
        let (mut c_seal, mut c_open) = client.into_split();
        let (mut s_seal, mut s_open) = server.into_split();

        let up = c_seal.seal(b"", b"up").unwrap();
        let down = s_seal.seal(b"", b"down").unwrap();
        assert_eq!(s_open.open(b"", &up).unwrap(), b"up");
        assert_eq!(c_open.open(b"", &down).unwrap(), b"down");
    }
}
