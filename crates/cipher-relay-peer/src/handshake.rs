//! Key-confirmation handshake run once per transport connection.
//!
//! ```text
//! client -> server   "CRLY" | version | client_random(32)
//! server -> client   "CRLY" | version | server_random(32) | server_proof(32)
//! client -> server   client_proof(32)
//! ```
//!
//! Proofs are HMAC-SHA256 under the auth key over `label | client_random |
//! server_random`. Neither side sends frame traffic until the peer's proof
//! has verified.

use std::fmt;
use std::time::Duration;

use cipher_relay_cipher::{
    handshake_random, CipherSession, MasterKey, Role, PROOF_SIZE, RANDOM_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{PeerError, Result};

/// Handshake magic.
pub const MAGIC: &[u8; 4] = b"CRLY";

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

const CLIENT_LABEL: &[u8] = b"client";
const SERVER_LABEL: &[u8] = b"server";

const HELLO_SIZE: usize = 4 + 1 + RANDOM_SIZE;

/// Configuration for handshake negotiation.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Perform the client side of the handshake.
pub async fn handshake_client<S>(
    stream: &mut S,
    key: &MasterKey,
    config: &HandshakeConfig,
) -> Result<CipherSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_deadline(config.timeout, client_exchange(stream, key)).await
}

/// Perform the server side of the handshake.
pub async fn handshake_server<S>(
    stream: &mut S,
    key: &MasterKey,
    config: &HandshakeConfig,
) -> Result<CipherSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_deadline(config.timeout, server_exchange(stream, key)).await
}

async fn with_deadline<F>(timeout: Duration, exchange: F) -> Result<CipherSession>
where
    F: std::future::Future<Output = Result<CipherSession>>,
{
    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(PeerError::HandshakeFailed(format!(
            "timed out after {timeout:?}"
        ))),
    }
}

async fn client_exchange<S>(stream: &mut S, key: &MasterKey) -> Result<CipherSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_random = handshake_random();

    let mut hello = Vec::with_capacity(HELLO_SIZE);
    hello.extend_from_slice(MAGIC);
    hello.push(PROTOCOL_VERSION);
    hello.extend_from_slice(&client_random);
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut reply = [0u8; HELLO_SIZE + PROOF_SIZE];
    read_handshake(stream, &mut reply).await?;
    let server_random = parse_hello(&reply[..HELLO_SIZE])?;

    key.verify_proof(
        SERVER_LABEL,
        &client_random,
        &server_random,
        &reply[HELLO_SIZE..],
    )?;

    let client_proof = key.proof(CLIENT_LABEL, &client_random, &server_random)?;
    stream.write_all(&client_proof).await?;
    stream.flush().await?;

    let keys = key.session_keys(&client_random, &server_random)?;
    debug!("client handshake complete");
    Ok(CipherSession::new(&keys, Role::Client))
}

async fn server_exchange<S>(stream: &mut S, key: &MasterKey) -> Result<CipherSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; HELLO_SIZE];
    read_handshake(stream, &mut hello).await?;
    let client_random = parse_hello(&hello)?;

    let server_random = handshake_random();
    let server_proof = key.proof(SERVER_LABEL, &client_random, &server_random)?;

    let mut reply = Vec::with_capacity(HELLO_SIZE + PROOF_SIZE);
    reply.extend_from_slice(MAGIC);
    reply.push(PROTOCOL_VERSION);
    reply.extend_from_slice(&server_random);
    reply.extend_from_slice(&server_proof);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let mut client_proof = [0u8; PROOF_SIZE];
    read_handshake(stream, &mut client_proof).await?;
    key.verify_proof(CLIENT_LABEL, &client_random, &server_random, &client_proof)?;

    let keys = key.session_keys(&client_random, &server_random)?;
    debug!("server handshake complete");
    Ok(CipherSession::new(&keys, Role::Server))
}

async fn read_handshake<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            PeerError::HandshakeFailed("connection closed during handshake".to_string()),
        ),
        Err(err) => Err(err.into()),
    }
}

fn parse_hello(hello: &[u8]) -> Result<[u8; RANDOM_SIZE]> {
    if &hello[..4] != MAGIC {
        return Err(PeerError::HandshakeFailed(
            "unknown protocol magic".to_string(),
        ));
    }
    if hello[4] != PROTOCOL_VERSION {
        return Err(PeerError::HandshakeFailed(format!(
            "unsupported protocol version {} (local {})",
            hello[4], PROTOCOL_VERSION
        )));
    }
    let mut random = [0u8; RANDOM_SIZE];
    random.copy_from_slice(&hello[5..HELLO_SIZE]);
    Ok(random)
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn key(secret: &str) -> MasterKey {
        MasterKey::derive(&secret.into()).expect("key derives")
    }

    #[tokio::test]
    async fn successful_handshake() {
        let (mut client, mut server) = duplex(1024);
        let config = HandshakeConfig::default();
        let client_key = key("shared");
        let server_key = key("shared");

        let (client_session, server_session) = tokio::join!(
            handshake_client(&mut client, &client_key, &config),
            handshake_server(&mut server, &server_key, &config),
        );
        let mut client_session = client_session.expect("client handshake should succeed");
        let mut server_session = server_session.expect("server handshake should succeed");

        let sealed = client_session.seal(b"", b"ping").expect("seal");
        assert_eq!(server_session.open(b"", &sealed).expect("open"), b"ping");
    }

    #[tokio::test]
    async fn wrong_secret_is_authentication_failure() {
        let (mut client, mut server) = duplex(1024);
        let config = HandshakeConfig {
            timeout: Duration::from_millis(500),
        };
        let client_key = key("guess");
        let server_key = key("actual");

        let (client_result, _server_result) = tokio::join!(
            async {
                let result = handshake_client(&mut client, &client_key, &config).await;
                drop(client);
                result
            },
            handshake_server(&mut server, &server_key, &config),
        );
        assert!(matches!(
            client_result,
            Err(PeerError::AuthenticationFailure)
        ));
    }

    #[tokio::test]
    async fn server_rejects_forged_client_proof() {
        let (mut client, mut server) = duplex(1024);
        let config = HandshakeConfig::default();
        let server_key = key("actual");

        let forger = async {
            let mut hello = Vec::new();
            hello.extend_from_slice(MAGIC);
            hello.push(PROTOCOL_VERSION);
            hello.extend_from_slice(&[7u8; RANDOM_SIZE]);
            client.write_all(&hello).await.expect("write hello");
            let mut reply = [0u8; HELLO_SIZE + PROOF_SIZE];
            client.read_exact(&mut reply).await.expect("read reply");
            client
                .write_all(&[0u8; PROOF_SIZE])
                .await
                .expect("write proof");
        };

        let (_, result) = tokio::join!(
            forger,
            handshake_server(&mut server, &server_key, &config)
        );
        assert!(matches!(result, Err(PeerError::AuthenticationFailure)));
    }

    #[tokio::test]
    async fn wrong_magic_rejected() {
        let (mut client, mut server) = duplex(1024);
        let mut hello = b"HTTP".to_vec();
        hello.push(PROTOCOL_VERSION);
        hello.extend_from_slice(&[0u8; RANDOM_SIZE]);
        client.write_all(&hello).await.expect("write");

        let result = handshake_server(&mut server, &key("k"), &HandshakeConfig::default()).await;
        match result {
            Err(PeerError::HandshakeFailed(msg)) => assert!(msg.contains("magic")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn version_mismatch() {
        let (mut client, mut server) = duplex(1024);
        let mut hello = MAGIC.to_vec();
        hello.push(PROTOCOL_VERSION + 1);
        hello.extend_from_slice(&[0u8; RANDOM_SIZE]);
        client.write_all(&hello).await.expect("write");

        let result = handshake_server(&mut server, &key("k"), &HandshakeConfig::default()).await;
        match result {
            Err(PeerError::HandshakeFailed(msg)) => assert!(msg.contains("version")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_timeout() {
        let (_client, mut server) = duplex(1024);
        let config = HandshakeConfig {
            timeout: Duration::from_millis(50),
        };

        let result = handshake_server(&mut server, &key("k"), &config).await;
        match result {
            Err(PeerError::HandshakeFailed(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_hangup_during_handshake() {
        let (client, mut server) = duplex(1024);
        drop(client);

        let result = handshake_server(&mut server, &key("k"), &HandshakeConfig::default()).await;
        assert!(matches!(result, Err(PeerError::HandshakeFailed(_))));
    }
}
