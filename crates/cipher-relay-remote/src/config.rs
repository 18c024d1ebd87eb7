use std::time::Duration;

use cipher_relay_cipher::SharedSecret;
use cipher_relay_peer::{HandshakeConfig, MuxConfig};

use crate::error::{RemoteError, Result};

/// Default remote relay listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9528";

/// Resolved configuration for the remote relay.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub listen_addr: String,
    pub secret: SharedSecret,
    pub handshake: HandshakeConfig,
    pub mux: MuxConfig,
    /// Deadline for dialing a destination on behalf of an OPEN.
    pub connect_timeout: Duration,
    pub half_close_grace: Duration,
    pub shutdown_grace: Duration,
}

impl RemoteConfig {
    pub fn new(secret: impl Into<SharedSecret>) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            secret: secret.into(),
            handshake: HandshakeConfig::default(),
            mux: MuxConfig::default(),
            connect_timeout: Duration::from_secs(10),
            half_close_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(RemoteError::Config("shared secret is empty".to_string()));
        }
        if self.mux.max_streams == 0
            || self.mux.max_frame_payload == 0
            || self.mux.initial_window == 0
        {
            return Err(RemoteError::Config(
                "multiplexer limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
