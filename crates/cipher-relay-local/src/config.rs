use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cipher_relay_cipher::SharedSecret;
use cipher_relay_peer::{ConnectorConfig, HandshakeConfig, MuxConfig};
use serde::{Deserialize, Serialize};

use crate::error::{LocalError, Result};

/// Default local proxy listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9527";

/// Default remote relay address.
pub const DEFAULT_REMOTE_ADDR: &str = "127.0.0.1:9528";

/// Which proxy protocol a listening port speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontEndMode {
    Socks5,
    Http,
    /// Detect per connection from the first byte.
    #[default]
    Mixed,
}

impl FromStr for FrontEndMode {
    type Err = LocalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "socks5" | "socks" => Ok(FrontEndMode::Socks5),
            "http" => Ok(FrontEndMode::Http),
            "mixed" => Ok(FrontEndMode::Mixed),
            other => Err(LocalError::Config(format!("unknown listener mode {other:?}"))),
        }
    }
}

impl fmt::Display for FrontEndMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrontEndMode::Socks5 => "socks5",
            FrontEndMode::Http => "http",
            FrontEndMode::Mixed => "mixed",
        })
    }
}

/// One local listening port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub addr: String,
    pub mode: FrontEndMode,
}

impl ListenerConfig {
    pub fn new(addr: impl Into<String>, mode: FrontEndMode) -> Self {
        Self {
            addr: addr.into(),
            mode,
        }
    }
}

impl FromStr for ListenerConfig {
    type Err = LocalError;

    /// Parse `host:port` or `mode@host:port`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('@') {
            Some((mode, addr)) => Ok(Self::new(addr, mode.parse()?)),
            None => Ok(Self::new(s, FrontEndMode::Mixed)),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LISTEN_ADDR, FrontEndMode::Mixed)
    }
}

/// SOCKS5 username/password credentials (RFC 1929).
#[derive(Clone, PartialEq, Eq)]
pub struct Socks5Auth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Socks5Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Auth")
            .field("username", &self.username)
            .field(
                "password",
                &format_args!("<redacted:{} bytes>", self.password.len()),
            )
            .finish()
    }
}

/// Resolved configuration for the local relay.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub listeners: Vec<ListenerConfig>,
    pub remote_addr: String,
    pub secret: SharedSecret,
    /// Require SOCKS5 clients to authenticate.
    pub socks_auth: Option<Socks5Auth>,
    pub connect_timeout: Duration,
    pub handshake: HandshakeConfig,
    pub mux: MuxConfig,
    pub max_connections: usize,
    /// Global cap on concurrently relayed client connections.
    pub max_streams: usize,
    /// Deadline for a client to finish its SOCKS/HTTP handshake.
    pub client_handshake_timeout: Duration,
    pub half_close_grace: Duration,
    pub shutdown_grace: Duration,
}

impl LocalConfig {
    pub fn new(secret: impl Into<SharedSecret>) -> Self {
        Self {
            listeners: vec![ListenerConfig::default()],
            remote_addr: DEFAULT_REMOTE_ADDR.to_string(),
            secret: secret.into(),
            socks_auth: None,
            connect_timeout: Duration::from_secs(10),
            handshake: HandshakeConfig::default(),
            mux: MuxConfig::default(),
            max_connections: 4,
            max_streams: 1024,
            client_handshake_timeout: Duration::from_secs(10),
            half_close_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(LocalError::Config("no listeners configured".to_string()));
        }
        if self.secret.is_empty() {
            return Err(LocalError::Config("shared secret is empty".to_string()));
        }
        if self.max_streams == 0 || self.max_connections == 0 || self.mux.max_streams == 0 {
            return Err(LocalError::Config(
                "stream and connection limits must be positive".to_string(),
            ));
        }
        if self.mux.max_frame_payload == 0 || self.mux.initial_window == 0 {
            return Err(LocalError::Config(
                "frame payload and window sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn connector(&self) -> ConnectorConfig {
        ConnectorConfig {
            remote_addr: self.remote_addr.clone(),
            connect_timeout: self.connect_timeout,
            handshake: self.handshake.clone(),
            mux: self.mux.clone(),
            max_connections: self.max_connections,
        }
    }
}
