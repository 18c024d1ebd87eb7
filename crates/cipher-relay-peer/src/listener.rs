use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cipher_relay_cipher::MasterKey;
use cipher_relay_transport::TcpAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection::{TransportConnection, WireCounters};
use crate::error::Result;
use crate::handshake::{handshake_server, HandshakeConfig};
use crate::mux::MuxConfig;
use crate::stream::IncomingStreams;

/// Accepts transport connections from local relays.
pub struct RelayListener {
    acceptor: TcpAcceptor,
    key: Arc<MasterKey>,
    handshake_config: HandshakeConfig,
    mux_config: MuxConfig,
    counters: Arc<WireCounters>,
    next_id: AtomicU64,
}

impl RelayListener {
    /// Serve relay connections on an already bound socket.
    pub fn new(acceptor: TcpAcceptor, key: Arc<MasterKey>) -> Self {
        Self {
            acceptor,
            key,
            handshake_config: HandshakeConfig::default(),
            mux_config: MuxConfig::default(),
            counters: Arc::new(WireCounters::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Override handshake config.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    /// Override per-connection multiplexing config.
    pub fn with_mux_config(mut self, config: MuxConfig) -> Self {
        self.mux_config = config;
        self
    }

    /// Accept the next socket. The handshake runs in [`PendingPeer::establish`]
    /// so a slow client cannot stall the accept loop.
    pub async fn accept(&self) -> Result<PendingPeer> {
        let (socket, peer) = self.acceptor.accept().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, %peer, "relay socket accepted");
        Ok(PendingPeer {
            id,
            socket,
            peer,
            key: self.key.clone(),
            handshake_config: self.handshake_config.clone(),
            mux_config: self.mux_config.clone(),
            counters: self.counters.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Sealed bytes over every connection this listener accepted.
    pub fn wire_counters(&self) -> &Arc<WireCounters> {
        &self.counters
    }
}

/// An accepted socket that has not finished the handshake.
pub struct PendingPeer {
    id: u64,
    socket: TcpStream,
    peer: SocketAddr,
    key: Arc<MasterKey>,
    handshake_config: HandshakeConfig,
    mux_config: MuxConfig,
    counters: Arc<WireCounters>,
}

impl PendingPeer {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Run the server handshake and start the connection.
    pub async fn establish(mut self) -> Result<(Arc<TransportConnection>, IncomingStreams)> {
        let session = handshake_server(&mut self.socket, &self.key, &self.handshake_config).await?;
        Ok(TransportConnection::spawn_server(
            self.id,
            self.peer.to_string(),
            self.socket,
            session,
            self.mux_config,
            self.counters,
        ))
    }
}
