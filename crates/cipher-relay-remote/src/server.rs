//! Accept transport connections and serve their streams.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cipher_relay_cipher::MasterKey;
use cipher_relay_peer::{
    splice, CloseReason, PendingPeer, RelayListener, StreamHandle, TrafficCounters, WireCounters,
};
use cipher_relay_transport::{connect_host, TcpAcceptor, TransportError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::Result;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const FORCED_CLOSE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    opened: AtomicU64,
    refused: AtomicU64,
    /// Upload is destination-to-stream, download is stream-to-destination.
    traffic: TrafficCounters,
}

struct Context {
    shutdown: CancellationToken,
    force_close: CancellationToken,
    tracker: TaskTracker,
    counters: Counters,
    connect_timeout: Duration,
    half_close_grace: Duration,
}

/// Traffic report for the remote relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStats {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub streams_opened: u64,
    pub streams_refused: u64,
    /// Plaintext bytes written to destinations.
    pub upstream_bytes: u64,
    /// Plaintext bytes read from destinations.
    pub downstream_bytes: u64,
    pub wire_sent_bytes: u64,
    pub wire_received_bytes: u64,
}

/// A running remote relay.
pub struct RemoteHandle {
    local_addr: SocketAddr,
    context: Arc<Context>,
    wire: Arc<WireCounters>,
    shutdown_grace: Duration,
}

impl RemoteHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> RemoteStats {
        let counters = &self.context.counters;
        RemoteStats {
            connections_accepted: counters.accepted.load(Ordering::Relaxed),
            active_connections: counters.active.load(Ordering::Relaxed),
            streams_opened: counters.opened.load(Ordering::Relaxed),
            streams_refused: counters.refused.load(Ordering::Relaxed),
            upstream_bytes: counters.traffic.download(),
            downstream_bytes: counters.traffic.upload(),
            wire_sent_bytes: self.wire.sent(),
            wire_received_bytes: self.wire.received(),
        }
    }

    /// Stop accepting, let open streams finish for up to the shutdown grace,
    /// then close every transport connection.
    pub async fn shutdown(self) -> RemoteStats {
        info!(grace = ?self.shutdown_grace, "shutting down remote relay");
        self.context.shutdown.cancel();
        self.context.tracker.close();

        if tokio::time::timeout(self.shutdown_grace, self.context.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.context.tracker.len(),
                "shutdown grace expired, closing transport connections"
            );
            self.context.force_close.cancel();
            let _ = tokio::time::timeout(FORCED_CLOSE_WAIT, self.context.tracker.wait()).await;
        }

        let stats = self.stats();
        info!(
            connections_accepted = stats.connections_accepted,
            streams_opened = stats.streams_opened,
            "remote relay stopped"
        );
        stats
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("local_addr", &self.local_addr)
            .field("shutting_down", &self.context.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Bind the relay listener and start serving transport connections.
pub async fn start(config: RemoteConfig) -> Result<RemoteHandle> {
    config.validate()?;
    let key = Arc::new(MasterKey::derive(&config.secret)?);
    let acceptor = TcpAcceptor::bind(&config.listen_addr).await?;
    let listener = RelayListener::new(acceptor, key)
        .with_handshake_config(config.handshake.clone())
        .with_mux_config(config.mux.clone());
    let local_addr = listener.local_addr();
    let wire = listener.wire_counters().clone();

    let context = Arc::new(Context {
        shutdown: CancellationToken::new(),
        force_close: CancellationToken::new(),
        tracker: TaskTracker::new(),
        counters: Counters::default(),
        connect_timeout: config.connect_timeout,
        half_close_grace: config.half_close_grace,
    });
    context
        .tracker
        .spawn(accept_loop(listener, context.clone()));
    info!(addr = %local_addr, "remote relay listening");

    Ok(RemoteHandle {
        local_addr,
        context,
        wire,
        shutdown_grace: config.shutdown_grace,
    })
}

async fn accept_loop(listener: RelayListener, context: Arc<Context>) {
    loop {
        let accepted = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(pending) => {
                context
                    .tracker
                    .spawn(serve_connection(pending, context.clone()));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    info!(addr = %listener.local_addr(), "relay listener closed");
}

struct ActiveGuard<'a>(&'a AtomicU64);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn serve_connection(pending: PendingPeer, context: Arc<Context>) {
    let peer = pending.peer_addr();
    let established = tokio::select! {
        _ = context.shutdown.cancelled() => return,
        established = pending.establish() => established,
    };
    let (conn, mut incoming) = match established {
        Ok(established) => established,
        Err(err) => {
            warn!(%peer, error = %err, "relay handshake failed");
            return;
        }
    };
    context.counters.accepted.fetch_add(1, Ordering::Relaxed);
    context.counters.active.fetch_add(1, Ordering::Relaxed);
    let _active = ActiveGuard(&context.counters.active);
    info!(connection_id = conn.id(), %peer, "relay connection established");

    let streams = TaskTracker::new();
    loop {
        let stream = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            next = incoming.next() => match next {
                Some(stream) => stream,
                None => break,
            },
        };
        streams.spawn(serve_stream(stream, context.clone()));
    }
    streams.close();

    tokio::select! {
        _ = streams.wait() => {}
        _ = conn.closed() => {}
        _ = context.force_close.cancelled() => {}
    }
    conn.close();
    info!(connection_id = conn.id(), %peer, "relay connection closed");
}

async fn serve_stream(stream: StreamHandle, context: Arc<Context>) {
    let destination = stream.destination().clone();
    let counters = &context.counters;
    let socket = match connect_host(&destination.host(), destination.port(), context.connect_timeout)
        .await
    {
        Ok(socket) => socket,
        Err(err) => {
            let reason = match err {
                TransportError::ConnectTimeout { .. } => CloseReason::Timeout,
                _ => CloseReason::Refused,
            };
            warn!(stream_id = stream.id(), %destination, error = %err, "destination unreachable");
            counters.refused.fetch_add(1, Ordering::Relaxed);
            stream.refuse(reason);
            return;
        }
    };
    if let Err(err) = stream.accept_open() {
        debug!(stream_id = stream.id(), error = %err, "stream gone before open completed");
        return;
    }
    counters.opened.fetch_add(1, Ordering::Relaxed);
    debug!(stream_id = stream.id(), %destination, "destination connected");

    if let Err(err) = splice(socket, &stream, context.half_close_grace, &counters.traffic).await {
        debug!(stream_id = stream.id(), %destination, error = %err, "relay ended with error");
    }
}

#[cfg(test)]
mod tests {
    use cipher_relay_peer::{connect, ConnectorConfig, Destination, PeerError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn key(secret: &str) -> MasterKey {
        MasterKey::derive(&secret.into()).expect("key derives")
    }

    async fn start_remote(secret: &str) -> RemoteHandle {
        let mut config = RemoteConfig::new(secret);
        config.listen_addr = "127.0.0.1:0".to_string();
        config.shutdown_grace = Duration::from_millis(200);
        start(config).await.expect("start")
    }

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn relays_stream_to_destination() {
        let remote = start_remote("remote").await;
        let echo = spawn_echo_server().await;

        let conn = connect(
            1,
            &key("remote"),
            &ConnectorConfig::new(remote.local_addr().to_string()),
            Arc::new(WireCounters::default()),
        )
        .await
        .expect("connect");
        let stream = conn.open_stream(Destination::Ip(echo)).await.expect("open");
        stream.write_all(b"through the relay").await.expect("write");
        let mut received = Vec::new();
        while received.len() < 17 {
            let chunk = stream.read().await.expect("read").expect("data");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"through the relay");

        let stats = remote.stats();
        assert_eq!(stats.connections_accepted, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.streams_opened, 1);
        assert_eq!(stats.upstream_bytes, 17);
        assert!(stats.wire_received_bytes > 17);
        drop(stream);
        drop(conn);
    }

    #[tokio::test]
    async fn unreachable_destination_is_refused() {
        let remote = start_remote("remote").await;
        let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let dead = closed.local_addr().expect("addr");
        drop(closed);

        let conn = connect(
            1,
            &key("remote"),
            &ConnectorConfig::new(remote.local_addr().to_string()),
            Arc::new(WireCounters::default()),
        )
        .await
        .expect("connect");
        let err = conn
            .open_stream(Destination::Ip(dead))
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            PeerError::RemoteRefused {
                reason: CloseReason::Refused,
                ..
            }
        ));
        assert_eq!(remote.stats().streams_refused, 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn wrong_secret_never_counts_as_connection() {
        let remote = start_remote("right").await;
        let result = connect(
            1,
            &key("wrong"),
            &ConnectorConfig::new(remote.local_addr().to_string()),
            Arc::new(WireCounters::default()),
        )
        .await;
        assert!(matches!(result, Err(PeerError::AuthenticationFailure)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.stats().connections_accepted, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_connections_after_grace() {
        let remote = start_remote("remote").await;
        let echo = spawn_echo_server().await;
        let conn = connect(
            1,
            &key("remote"),
            &ConnectorConfig::new(remote.local_addr().to_string()),
            Arc::new(WireCounters::default()),
        )
        .await
        .expect("connect");
        let _stream = conn.open_stream(Destination::Ip(echo)).await.expect("open");

        let stats = remote.shutdown().await;
        assert_eq!(stats.connections_accepted, 1);
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("local side observes close");
    }

    #[test]
    fn stats_serialize_with_field_names() {
        let json = serde_json::to_value(RemoteStats::default()).expect("serialize");
        assert_eq!(json["streams_refused"], 0);
        assert_eq!(json["upstream_bytes"], 0);
    }
}
