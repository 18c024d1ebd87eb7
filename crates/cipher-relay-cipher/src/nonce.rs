//! Nonce layout.
//!
//! ```text
//! [ direction (1) | zeros (3) | counter (8, BE) ]
//! ```
//!
//! Each direction uses its own key, and the direction byte keeps the two
//! nonce spaces disjoint even if both keys were ever equal.

/// ChaCha20-Poly1305 nonce size.
pub const NONCE_SIZE: usize = 12;

/// Which way a payload travels on a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local (client) side to remote (server) side.
    ClientToServer,
    /// Remote (server) side to local (client) side.
    ServerToClient,
}

impl Direction {
    /// The direction byte placed at the start of the nonce.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::ClientToServer => 0x00,
            Direction::ServerToClient => 0x01,
        }
    }

    /// The other direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// Build the nonce for `counter` in `direction`.
pub fn construct_nonce(direction: Direction, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = direction.as_byte();
    nonce[4..12].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_layout() {
        let nonce = construct_nonce(Direction::ServerToClient, 0x0102);
        assert_eq!(nonce, [0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn directions_never_collide() {
        for counter in [0u64, 1, 42, u64::MAX - 1] {
            assert_ne!(
                construct_nonce(Direction::ClientToServer, counter),
                construct_nonce(Direction::ServerToClient, counter)
            );
        }
        assert_eq!(
            Direction::ClientToServer.opposite(),
            Direction::ServerToClient
        );
    }
}
