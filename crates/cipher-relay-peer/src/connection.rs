//! One authenticated, encrypted transport connection.
//!
//! Each connection runs three tasks: a reader that opens inbound frames and
//! hands them to the multiplexer, a writer that seals queued frames in
//! submission order, and a keepalive that pings and enforces the idle timeout.
//! Whichever task fails first tears the connection down and fails every
//! stream on it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cipher_relay_cipher::{CipherSession, Opener, Sealer, TAG_SIZE};
use cipher_relay_frame::{Frame, FrameCodec, FrameConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::control::Destination;
use crate::error::{PeerError, Result};
use crate::mux::{MuxConfig, Multiplexer};
use crate::stream::{IncomingStreams, StreamHandle};

/// Smallest frame payload the codec must accept so control frames always fit.
const MIN_WIRE_PAYLOAD: usize = 512;

/// Sealed bytes moved over transport connections, including frame headers.
#[derive(Debug, Default)]
pub struct WireCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl WireCounters {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }
}

struct Activity {
    epoch: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

#[derive(Clone)]
struct Teardown {
    id: u64,
    mux: Arc<Multiplexer>,
    cancel: CancellationToken,
}

impl Teardown {
    /// Fail every stream and stop the connection's tasks. Only the first
    /// call has any effect.
    fn fire(&self, cause: PeerError) {
        if self.cancel.is_cancelled() {
            return;
        }
        let stream_error = match cause {
            PeerError::ConnectionClosed => {
                debug!(connection_id = self.id, "transport connection closed locally");
                PeerError::ConnectionClosed
            }
            ref other => {
                warn!(connection_id = self.id, error = %other, "transport connection lost");
                PeerError::PeerUnreachable(other.to_string())
            }
        };
        self.mux.fail_all(stream_error);
        self.cancel.cancel();
    }
}

/// An authenticated transport connection carrying multiplexed streams.
pub struct TransportConnection {
    id: u64,
    peer: String,
    mux: Arc<Multiplexer>,
    teardown: Teardown,
}

impl TransportConnection {
    /// Start the connection tasks for the dialing side.
    ///
    /// `stream` must already have completed the client handshake that
    /// produced `session`.
    pub fn spawn_client<S>(
        id: u64,
        peer: impl Into<String>,
        stream: S,
        session: CipherSession,
        config: MuxConfig,
        counters: Arc<WireCounters>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::initiator(config, tx);
        Self::spawn(id, peer.into(), stream, session, mux, rx, counters)
    }

    /// Start the connection tasks for the accepting side.
    pub fn spawn_server<S>(
        id: u64,
        peer: impl Into<String>,
        stream: S,
        session: CipherSession,
        config: MuxConfig,
        counters: Arc<WireCounters>,
    ) -> (Arc<Self>, IncomingStreams)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (mux, incoming) = Multiplexer::responder(config, tx);
        let conn = Self::spawn(id, peer.into(), stream, session, mux, rx, counters);
        (conn, incoming)
    }

    fn spawn<S>(
        id: u64,
        peer: String,
        stream: S,
        session: CipherSession,
        mux: Arc<Multiplexer>,
        outbound: mpsc::UnboundedReceiver<Frame>,
        counters: Arc<WireCounters>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = mux.config().clone();
        let wire_max = config.max_frame_payload.max(MIN_WIRE_PAYLOAD) + TAG_SIZE;
        let codec = || {
            FrameCodec::with_config(FrameConfig {
                max_payload_size: wire_max,
            })
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (sealer, opener) = session.into_split();
        let activity = Arc::new(Activity::new());
        let teardown = Teardown {
            id,
            mux: mux.clone(),
            cancel: CancellationToken::new(),
        };

        {
            let teardown = teardown.clone();
            let frames = FramedRead::new(read_half, codec());
            let mux = mux.clone();
            let activity = activity.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                let cause = tokio::select! {
                    _ = teardown.cancel.cancelled() => return,
                    cause = read_loop(frames, opener, mux, activity, counters) => cause,
                };
                teardown.fire(cause);
            });
        }

        {
            let teardown = teardown.clone();
            let sink = FramedWrite::new(write_half, codec());
            tokio::spawn(async move {
                let cause = tokio::select! {
                    _ = teardown.cancel.cancelled() => return,
                    cause = write_loop(sink, sealer, outbound, counters) => cause,
                };
                teardown.fire(cause);
            });
        }

        {
            let teardown = teardown.clone();
            let mux = mux.clone();
            tokio::spawn(async move {
                let cause = tokio::select! {
                    _ = teardown.cancel.cancelled() => return,
                    cause = keepalive_loop(mux, activity, config) => cause,
                };
                teardown.fire(cause);
            });
        }

        info!(connection_id = id, %peer, "transport connection started");
        Arc::new(Self {
            id,
            peer,
            mux,
            teardown,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address as text.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Open a stream to `destination` through the remote relay.
    pub async fn open_stream(&self, destination: Destination) -> Result<StreamHandle> {
        self.mux.open_stream(destination).await
    }

    pub fn active_streams(&self) -> usize {
        self.mux.active_streams()
    }

    /// True if another stream can be opened here right now.
    pub fn has_capacity(&self) -> bool {
        !self.is_closed() && self.active_streams() < self.mux.config().max_streams
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.cancel.is_cancelled()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.teardown.cancel.cancelled().await;
    }

    /// Token cancelled when the connection is torn down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.teardown.cancel.clone()
    }

    /// Close the connection. Open streams fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.teardown.fire(PeerError::ConnectionClosed);
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.teardown.fire(PeerError::ConnectionClosed);
    }
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("active_streams", &self.active_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    mut opener: Opener,
    mux: Arc<Multiplexer>,
    activity: Arc<Activity>,
    counters: Arc<WireCounters>,
) -> PeerError
where
    R: AsyncRead + Unpin,
{
    loop {
        let sealed = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return err.into(),
            None => return PeerError::PeerUnreachable("connection closed by peer".to_string()),
        };
        counters.add_received(sealed.wire_size());
        activity.touch();

        let plaintext = match opener.open(&sealed.routing_header(), &sealed.payload) {
            Ok(plaintext) => plaintext,
            Err(err) => return err.into(),
        };
        let frame = Frame::new(sealed.kind, sealed.stream_id, plaintext);
        trace!(kind = %frame.kind, stream_id = frame.stream_id, len = frame.len(), "frame received");

        if let Err(err) = mux.on_frame_received(frame) {
            return err;
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut sealer: Sealer,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    counters: Arc<WireCounters>,
) -> PeerError
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let sealed = match sealer.seal(&frame.routing_header(), &frame.payload) {
            Ok(sealed) => sealed,
            Err(err) => return err.into(),
        };
        let wire = Frame::new(frame.kind, frame.stream_id, sealed);
        let size = wire.wire_size();
        if let Err(err) = sink.send(wire).await {
            return err.into();
        }
        counters.add_sent(size);
    }
    PeerError::ConnectionClosed
}

async fn keepalive_loop(
    mux: Arc<Multiplexer>,
    activity: Arc<Activity>,
    config: MuxConfig,
) -> PeerError {
    let period = config
        .keepalive_interval
        .min(config.idle_timeout / 4)
        .max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ping = Instant::now();

    loop {
        ticker.tick().await;
        let idle = activity.idle();
        if idle >= config.idle_timeout {
            return PeerError::PeerUnreachable(format!("no traffic for {idle:?}"));
        }
        if last_ping.elapsed() >= config.keepalive_interval {
            mux.send_ping();
            last_ping = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use cipher_relay_cipher::MasterKey;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::handshake::{handshake_client, handshake_server, HandshakeConfig};

    fn dest(port: u16) -> Destination {
        Destination::Ip(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    async fn sessions() -> (DuplexStream, CipherSession, DuplexStream, CipherSession) {
        let (client, server) = duplex(256 * 1024);
        handshake_over(client, server).await
    }

    async fn handshake_over(
        mut client: DuplexStream,
        mut server: DuplexStream,
    ) -> (DuplexStream, CipherSession, DuplexStream, CipherSession) {
        let key = MasterKey::derive(&"connection tests".into()).expect("key derives");
        let config = HandshakeConfig::default();
        let (c, s) = tokio::join!(
            handshake_client(&mut client, &key, &config),
            handshake_server(&mut server, &key, &config),
        );
        (
            client,
            c.expect("client handshake"),
            server,
            s.expect("server handshake"),
        )
    }

    #[tokio::test]
    async fn relays_data_both_ways() {
        let (client_io, client_session, server_io, server_session) = sessions().await;
        let counters = Arc::new(WireCounters::default());
        let client = TransportConnection::spawn_client(
            1,
            "test",
            client_io,
            client_session,
            MuxConfig::default(),
            counters.clone(),
        );
        let (_server, mut incoming) = TransportConnection::spawn_server(
            1,
            "test",
            server_io,
            server_session,
            MuxConfig::default(),
            Arc::new(WireCounters::default()),
        );

        tokio::spawn(async move {
            let stream = incoming.next().await.expect("incoming stream");
            stream.accept_open().expect("accept");
            while let Some(chunk) = stream.read().await.expect("read") {
                stream.write_all(&chunk).await.expect("echo");
            }
            stream.close();
        });

        let stream = client.open_stream(dest(7)).await.expect("open");
        let payload = vec![0x5A; 100 * 1024];
        stream.write_all(&payload).await.expect("write");
        stream.close();

        let mut echoed = Vec::new();
        while let Some(chunk) = stream.read().await.expect("read") {
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, payload);
        assert!(counters.sent() > payload.len() as u64);
        assert!(counters.received() > payload.len() as u64);
    }

    #[tokio::test]
    async fn socket_loss_fails_every_stream_with_peer_unreachable() {
        let (client_io, client_session, server_io, server_session) = sessions().await;
        let client = TransportConnection::spawn_client(
            1,
            "test",
            client_io,
            client_session,
            MuxConfig::default(),
            Arc::new(WireCounters::default()),
        );
        let (server, mut incoming) = TransportConnection::spawn_server(
            1,
            "test",
            server_io,
            server_session,
            MuxConfig::default(),
            Arc::new(WireCounters::default()),
        );

        let acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..3 {
                let stream = incoming.next().await.expect("incoming stream");
                stream.accept_open().expect("accept");
                held.push(stream);
            }
            held
        });

        let mut streams = Vec::new();
        for port in 1..=3 {
            streams.push(client.open_stream(dest(port)).await.expect("open"));
        }
        let held = acceptor.await.expect("acceptor task");
        assert_eq!(client.active_streams(), 3);

        server.close();
        drop(held);

        for stream in &streams {
            match stream.read().await {
                Err(PeerError::PeerUnreachable(_)) => {}
                other => panic!("unexpected read result: {other:?}"),
            }
        }
        client.closed().await;
        assert!(client.is_closed());
        assert_eq!(client.active_streams(), 0);
    }

    /// A pipe pair joined by a forwarding task. Cancelling `stall` stops the
    /// forwarding but keeps both ends open, like a path that silently drops.
    fn stalling_pipe(stall: CancellationToken) -> (DuplexStream, DuplexStream) {
        let (client, mut near) = duplex(256 * 1024);
        let (mut far, server) = duplex(256 * 1024);
        tokio::spawn(async move {
            tokio::select! {
                _ = stall.cancelled() => {}
                _ = tokio::io::copy_bidirectional(&mut near, &mut far) => return,
            }
            std::future::pending::<()>().await;
            drop((near, far));
        });
        (client, server)
    }

    #[tokio::test]
    async fn silent_drop_fails_every_stream_within_idle_timeout() {
        let stall = CancellationToken::new();
        let (client_io, server_io) = stalling_pipe(stall.clone());
        let (client_io, client_session, server_io, server_session) =
            handshake_over(client_io, server_io).await;
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(200),
            ..MuxConfig::default()
        };
        let client = TransportConnection::spawn_client(
            1,
            "test",
            client_io,
            client_session,
            config.clone(),
            Arc::new(WireCounters::default()),
        );
        let (_server, mut incoming) = TransportConnection::spawn_server(
            1,
            "test",
            server_io,
            server_session,
            config.clone(),
            Arc::new(WireCounters::default()),
        );

        let acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..3 {
                let stream = incoming.next().await.expect("incoming stream");
                stream.accept_open().expect("accept");
                held.push(stream);
            }
            held
        });
        let mut streams = Vec::new();
        for port in 1..=3 {
            streams.push(client.open_stream(dest(port)).await.expect("open"));
        }
        let _held = acceptor.await.expect("acceptor task");
        assert_eq!(client.active_streams(), 3);

        stall.cancel();
        let stalled_at = Instant::now();
        // One idle timeout plus a keepalive tick, with room for scheduling.
        let deadline = config.idle_timeout + config.keepalive_interval * 4;

        for stream in &streams {
            let result = tokio::time::timeout(deadline, stream.read())
                .await
                .expect("stream should fail before the deadline");
            match result {
                Err(PeerError::PeerUnreachable(_)) => {}
                other => panic!("unexpected read result: {other:?}"),
            }
        }
        assert!(stalled_at.elapsed() <= deadline);
        assert!(client.is_closed());
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn tampered_frame_tears_down_connection() {
        let (client_io, client_session, mut server_io, _server_session) = sessions().await;
        let client = TransportConnection::spawn_client(
            1,
            "test",
            client_io,
            client_session,
            MuxConfig::default(),
            Arc::new(WireCounters::default()),
        );

        // A well-formed frame header followed by garbage ciphertext.
        let mut wire = vec![0x05, 0, 0, 0, 0, 0, 0, 0, 17];
        wire.extend_from_slice(&[0xAA; 17]);
        server_io.write_all(&wire).await.expect("write");

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("connection should close");
        assert!(matches!(
            client.open_stream(dest(1)).await,
            Err(PeerError::ConnectionUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let (client_io, client_session, _server_io, _server_session) = sessions().await;
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(100),
            ..MuxConfig::default()
        };
        let client = TransportConnection::spawn_client(
            1,
            "test",
            client_io,
            client_session,
            config,
            Arc::new(WireCounters::default()),
        );

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("idle connection should be torn down");
    }

    #[tokio::test]
    async fn keepalive_holds_quiet_connection_open() {
        let (client_io, client_session, server_io, server_session) = sessions().await;
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(150),
            ..MuxConfig::default()
        };
        let client = TransportConnection::spawn_client(
            1,
            "test",
            client_io,
            client_session,
            config.clone(),
            Arc::new(WireCounters::default()),
        );
        let (server, _incoming) = TransportConnection::spawn_server(
            1,
            "test",
            server_io,
            server_session,
            config,
            Arc::new(WireCounters::default()),
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }
}
