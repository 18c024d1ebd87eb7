//! Dialing side: connect to the remote relay and pool the connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cipher_relay_cipher::MasterKey;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info};

use crate::connection::{TransportConnection, WireCounters};
use crate::error::{PeerError, Result};
use crate::handshake::{handshake_client, HandshakeConfig};
use crate::mux::{lock, MuxConfig};

/// Settings for dialing the remote relay.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Remote relay address, `host:port`.
    pub remote_addr: String,
    pub connect_timeout: Duration,
    pub handshake: HandshakeConfig,
    pub mux: MuxConfig,
    /// Upper bound on pooled transport connections.
    pub max_connections: usize,
}

impl ConnectorConfig {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            connect_timeout: Duration::from_secs(10),
            handshake: HandshakeConfig::default(),
            mux: MuxConfig::default(),
            max_connections: 4,
        }
    }
}

/// Dial the remote relay and complete the handshake.
///
/// Returns a connection whose reader, writer and keepalive tasks are running.
pub async fn connect(
    id: u64,
    key: &MasterKey,
    config: &ConnectorConfig,
    counters: Arc<WireCounters>,
) -> Result<Arc<TransportConnection>> {
    let mut socket =
        cipher_relay_transport::connect(&config.remote_addr, config.connect_timeout).await?;
    let peer = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| config.remote_addr.clone());

    let session = handshake_client(&mut socket, key, &config.handshake).await?;
    debug!(connection_id = id, %peer, "handshake complete");

    Ok(TransportConnection::spawn_client(
        id,
        peer,
        socket,
        session,
        config.mux.clone(),
        counters,
    ))
}

type PendingConnect = Shared<BoxFuture<'static, Result<Arc<TransportConnection>>>>;

struct Pool {
    connections: Vec<Arc<TransportConnection>>,
    pending: Option<(u64, PendingConnect)>,
    closed: bool,
}

struct ManagerInner {
    config: ConnectorConfig,
    key: Arc<MasterKey>,
    pool: Mutex<Pool>,
    counters: Arc<WireCounters>,
    next_id: AtomicU64,
}

/// Pool of transport connections to one remote relay.
///
/// Reuses healthy connections with spare stream capacity, dials a new one
/// only when none has room, and never keeps a dead connection. Concurrent
/// callers that need a new connection share a single dial.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectorConfig, key: Arc<MasterKey>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                key,
                pool: Mutex::new(Pool {
                    connections: Vec::new(),
                    pending: None,
                    closed: false,
                }),
                counters: Arc::new(WireCounters::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// A healthy connection with stream capacity, dialing one if needed.
    ///
    /// Fails without retrying when the dial fails or every pooled
    /// connection is full and the pool is at its size limit.
    pub async fn get_or_create(&self) -> Result<Arc<TransportConnection>> {
        let (attempt, dial) = {
            let mut pool = lock(&self.inner.pool);
            if pool.closed {
                return Err(PeerError::ConnectionClosed);
            }
            pool.connections.retain(|conn| !conn.is_closed());

            if let Some(conn) = pool
                .connections
                .iter()
                .filter(|conn| conn.has_capacity())
                .min_by_key(|conn| conn.active_streams())
            {
                return Ok(conn.clone());
            }

            match &pool.pending {
                Some((attempt, dial)) => (*attempt, dial.clone()),
                None => {
                    if pool.connections.len() >= self.inner.config.max_connections {
                        return Err(PeerError::ConnectionUnavailable(format!(
                            "all {} connections are at their stream limit",
                            pool.connections.len()
                        )));
                    }
                    let attempt = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let inner = self.inner.clone();
                    let dial = async move {
                        connect(attempt, &inner.key, &inner.config, inner.counters.clone()).await
                    }
                    .boxed()
                    .shared();
                    pool.pending = Some((attempt, dial.clone()));
                    debug!(connection_id = attempt, remote = %self.inner.config.remote_addr, "dialing remote relay");
                    (attempt, dial)
                }
            }
        };

        let result = dial.await;

        let mut pool = lock(&self.inner.pool);
        if matches!(&pool.pending, Some((id, _)) if *id == attempt) {
            pool.pending = None;
        }
        let conn = result?;
        if pool.closed {
            conn.close();
            return Err(PeerError::ConnectionClosed);
        }
        if !conn.is_closed() && !pool.connections.iter().any(|c| Arc::ptr_eq(c, &conn)) {
            pool.connections.push(conn.clone());
            info!(
                connection_id = conn.id(),
                pool_size = pool.connections.len(),
                "transport connection added to pool"
            );
            self.watch(&conn);
        }
        Ok(conn)
    }

    /// Remove `conn` from the pool as soon as it closes.
    fn watch(&self, conn: &Arc<TransportConnection>) {
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(conn);
        let closed = conn.shutdown_token();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(inner) = manager.upgrade() {
                let mut pool = lock(&inner.pool);
                pool.connections
                    .retain(|c| !std::ptr::eq(Arc::as_ptr(c), watched.as_ptr()));
                info!(pool_size = pool.connections.len(), "transport connection removed from pool");
            }
        });
    }

    /// Healthy pooled connections.
    pub fn connection_count(&self) -> usize {
        let mut pool = lock(&self.inner.pool);
        pool.connections.retain(|conn| !conn.is_closed());
        pool.connections.len()
    }

    /// Streams open across all pooled connections.
    pub fn active_streams(&self) -> usize {
        lock(&self.inner.pool)
            .connections
            .iter()
            .map(|conn| conn.active_streams())
            .sum()
    }

    /// Sealed bytes sent and received by every connection this pool dialed.
    pub fn wire_counters(&self) -> &Arc<WireCounters> {
        &self.inner.counters
    }

    /// Close every connection and refuse further requests.
    pub fn close_all(&self) {
        let connections = {
            let mut pool = lock(&self.inner.pool);
            pool.closed = true;
            pool.pending = None;
            std::mem::take(&mut pool.connections)
        };
        for conn in connections {
            conn.close();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("remote_addr", &self.inner.config.remote_addr)
            .field("max_connections", &self.inner.config.max_connections)
            .finish_non_exhaustive()
    }
}
