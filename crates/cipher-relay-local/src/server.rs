//! Listener accept loops and per-client relay tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cipher_relay_cipher::MasterKey;
use cipher_relay_peer::splice;
use cipher_relay_transport::TcpAcceptor;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::adapter::{ClientRequest, FrontEnd, RelayRequest};
use crate::config::{FrontEndMode, LocalConfig, Socks5Auth};
use crate::error::{LocalError, Result};
use crate::http;
use crate::registry::StatsSnapshot;
use crate::supervisor::{Admission, Supervisor};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Paths answered with the traffic report.
const STATS_PATHS: &[&str] = &["/", "/stats"];

struct ClientSettings {
    auth: Option<Socks5Auth>,
    handshake_timeout: Duration,
    half_close_grace: Duration,
}

/// A running local relay.
#[derive(Debug)]
pub struct RunningHandle {
    supervisor: Arc<Supervisor>,
    local_addrs: Vec<SocketAddr>,
    shutdown_grace: Duration,
}

impl RunningHandle {
    /// Bound address of each configured listener, in configuration order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.supervisor.stats()
    }

    /// Stop listening, drain in-flight relays, close transport connections,
    /// and return final statistics.
    pub async fn shutdown(self) -> StatsSnapshot {
        self.supervisor.shutdown(self.shutdown_grace).await
    }
}

/// Bind every listener and start serving clients.
///
/// Fails if the configuration is invalid or any listener cannot be bound.
/// The remote relay is dialed lazily on the first client request.
pub async fn start(config: LocalConfig) -> Result<RunningHandle> {
    config.validate()?;
    let key = Arc::new(MasterKey::derive(&config.secret)?);

    let mut acceptors = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        let acceptor = TcpAcceptor::bind(&listener.addr).await?;
        info!(addr = %acceptor.local_addr(), mode = %listener.mode, "listening");
        acceptors.push((acceptor, listener.mode));
    }

    let supervisor = Arc::new(Supervisor::new(&config, key));
    let settings = Arc::new(ClientSettings {
        auth: config.socks_auth.clone(),
        handshake_timeout: config.client_handshake_timeout,
        half_close_grace: config.half_close_grace,
    });

    let mut local_addrs = Vec::with_capacity(acceptors.len());
    for (acceptor, mode) in acceptors {
        local_addrs.push(acceptor.local_addr());
        supervisor.tracker().spawn(accept_loop(
            acceptor,
            mode,
            supervisor.clone(),
            settings.clone(),
        ));
    }
    info!(remote = %config.remote_addr, max_streams = config.max_streams, "local relay started");

    Ok(RunningHandle {
        supervisor,
        local_addrs,
        shutdown_grace: config.shutdown_grace,
    })
}

async fn accept_loop(
    acceptor: TcpAcceptor,
    mode: FrontEndMode,
    supervisor: Arc<Supervisor>,
    settings: Arc<ClientSettings>,
) {
    let shutdown = supervisor.shutdown_token();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        let (socket, client) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let admission = match supervisor.try_admit() {
            Ok(admission) => admission,
            Err(err) => {
                warn!(%client, error = %err, "client rejected");
                continue;
            }
        };
        debug!(%client, %mode, "client accepted");
        supervisor.tracker().spawn(serve_client(
            socket,
            client,
            mode,
            supervisor.clone(),
            settings.clone(),
            admission,
        ));
    }
    info!(addr = %acceptor.local_addr(), "listener closed");
}

async fn serve_client(
    mut socket: TcpStream,
    client: SocketAddr,
    mode: FrontEndMode,
    supervisor: Arc<Supervisor>,
    settings: Arc<ClientSettings>,
    _admission: Admission,
) {
    let shutdown = supervisor.shutdown_token();
    let negotiated = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = tokio::time::timeout(
            settings.handshake_timeout,
            negotiate(&mut socket, mode, &settings),
        ) => result.unwrap_or(Err(LocalError::HandshakeTimeout)),
    };

    match negotiated {
        Ok(ClientRequest::Relay(request)) => {
            relay(socket, client, request, &supervisor, &settings).await;
        }
        Ok(ClientRequest::Local { version, path }) => {
            let result = if STATS_PATHS.contains(&path.as_str()) {
                http::send_text(&mut socket, &version, &supervisor.stats().render_text()).await
            } else {
                http::send_status(&mut socket, &version, 404, "Not Found").await
            };
            if let Err(err) = result {
                debug!(%client, error = %err, "local response failed");
            }
        }
        Err(err) => debug!(%client, error = %err, "client handshake failed"),
    }
}

async fn negotiate(
    socket: &mut TcpStream,
    mode: FrontEndMode,
    settings: &ClientSettings,
) -> Result<ClientRequest> {
    let front_end = FrontEnd::detect(mode, settings.auth.as_ref(), socket).await?;
    front_end.handshake(socket).await
}

async fn relay(
    mut socket: TcpStream,
    client: SocketAddr,
    request: RelayRequest,
    supervisor: &Supervisor,
    settings: &ClientSettings,
) {
    let destination = request.destination().clone();
    let stream = match supervisor.open_relayed_stream(destination.clone()).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%client, %destination, error = %err, "stream open failed");
            if let Err(reply_err) = request.reply_failure(&mut socket, &err).await {
                debug!(%client, error = %reply_err, "failure reply not delivered");
            }
            let _ = socket.shutdown().await;
            return;
        }
    };

    if let Err(err) = request.reply_success(&mut socket).await {
        debug!(%client, stream_id = stream.id(), error = %err, "client gone before relay");
        return;
    }

    let registered = supervisor
        .registry()
        .register(client, request.protocol(), &destination);
    let replay = request.replay();
    if !replay.is_empty() {
        if let Err(err) = stream.write_all(&replay).await {
            debug!(stream_id = stream.id(), error = %err, "replay failed");
            return;
        }
        registered.counters().add_upload(replay.len());
    }

    info!(
        connection_id = registered.id(),
        %client,
        %destination,
        protocol = %request.protocol(),
        stream_id = stream.id(),
        "relaying"
    );
    let result = splice(socket, &stream, settings.half_close_grace, registered.counters()).await;
    let counters = registered.counters();
    match result {
        Ok(()) => debug!(
            connection_id = registered.id(),
            upload = counters.upload(),
            download = counters.download(),
            "relay finished"
        ),
        Err(err) => debug!(
            connection_id = registered.id(),
            upload = counters.upload(),
            download = counters.download(),
            error = %err,
            "relay ended with error"
        ),
    }
}

#[cfg(test)]
mod tests {
    use cipher_relay_peer::{Destination, RelayListener};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ListenerConfig;

    /// In-process remote relay that echoes every stream and reports each
    /// OPEN destination.
    async fn spawn_echo_relay(secret: &str) -> (SocketAddr, mpsc::UnboundedReceiver<Destination>) {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.expect("bind");
        let addr = acceptor.local_addr();
        let key = Arc::new(MasterKey::derive(&secret.into()).expect("key"));
        let listener = RelayListener::new(acceptor, key);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(pending) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok((_conn, mut incoming)) = pending.establish().await else { return };
                    while let Some(stream) = incoming.next().await {
                        let _ = tx.send(stream.destination().clone());
                        let _ = stream.accept_open();
                        tokio::spawn(async move {
                            while let Ok(Some(chunk)) = stream.read().await {
                                if stream.write_all(&chunk).await.is_err() {
                                    return;
                                }
                            }
                            stream.close();
                        });
                    }
                });
            }
        });
        (addr, rx)
    }

    fn local_config(remote: SocketAddr, mode: FrontEndMode) -> LocalConfig {
        let mut config = LocalConfig::new("server-test");
        config.remote_addr = remote.to_string();
        config.listeners = vec![ListenerConfig::new("127.0.0.1:0", mode)];
        config
    }

    #[tokio::test]
    async fn socks5_connect_opens_stream_and_relays() {
        let (remote, mut opened) = spawn_echo_relay("server-test").await;
        let handle = start(local_config(remote, FrontEndMode::Socks5))
            .await
            .expect("start");

        let mut client = TcpStream::connect(handle.local_addrs()[0]).await.expect("connect");
        client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.expect("method");
        assert_eq!(method, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
            .await
            .expect("request");
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.expect("reply");
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            opened.recv().await.expect("open seen"),
            Destination::Ip("127.0.0.1:80".parse().expect("addr"))
        );

        client.write_all(b"hello relay").await.expect("write");
        let mut echoed = [0u8; 11];
        client.read_exact(&mut echoed).await.expect("echo");
        assert_eq!(&echoed, b"hello relay");

        let stats = handle.stats();
        assert_eq!(stats.active_connections.len(), 1);
        assert_eq!(stats.transport_connections, 1);

        drop(client);
        let stats = handle.shutdown().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.upload_bytes, 11);
        assert_eq!(stats.download_bytes, 11);
    }

    #[tokio::test]
    async fn mixed_port_serves_http_connect() {
        let (remote, mut opened) = spawn_echo_relay("server-test").await;
        let handle = start(local_config(remote, FrontEndMode::Mixed))
            .await
            .expect("start");

        let mut client = TcpStream::connect(handle.local_addrs()[0]).await.expect("connect");
        client
            .write_all(b"CONNECT svc.test:443 HTTP/1.1\r\nHost: svc.test:443\r\n\r\n")
            .await
            .expect("request");
        let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).await.expect("reply");
        assert_eq!(reply, expected);
        assert_eq!(
            opened.recv().await.expect("open seen"),
            Destination::Domain("svc.test".into(), 443)
        );

        client.write_all(b"tunnel").await.expect("write");
        let mut echoed = [0u8; 6];
        client.read_exact(&mut echoed).await.expect("echo");
        assert_eq!(&echoed, b"tunnel");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stats_endpoint_answers_locally() {
        let (remote, _opened) = spawn_echo_relay("server-test").await;
        let handle = start(local_config(remote, FrontEndMode::Http))
            .await
            .expect("start");

        let mut client = TcpStream::connect(handle.local_addrs()[0]).await.expect("connect");
        client
            .write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("request");
        let mut response = String::new();
        client.read_to_string(&mut response).await.expect("response");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("connections: 0 active, 0 total"));
        assert_eq!(handle.stats().transport_connections, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_remote_gets_failure_reply() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.expect("bind");
        let remote = acceptor.local_addr();
        drop(acceptor);
        let handle = start(local_config(remote, FrontEndMode::Http))
            .await
            .expect("start");

        let mut client = TcpStream::connect(handle.local_addrs()[0]).await.expect("connect");
        client
            .write_all(b"CONNECT svc.test:443 HTTP/1.1\r\n\r\n")
            .await
            .expect("request");
        let mut response = String::new();
        client.read_to_string(&mut response).await.expect("response");
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{response}");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn admission_cap_drops_excess_clients() {
        let (remote, _opened) = spawn_echo_relay("server-test").await;
        let mut config = local_config(remote, FrontEndMode::Socks5);
        config.max_streams = 1;
        let handle = start(config).await.expect("start");
        let addr = handle.local_addrs()[0];

        // Holds the only slot while it sits in the handshake.
        let _first = TcpStream::connect(addr).await.expect("first");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.expect("second");
        let _ = second.write_all(&[0x05, 0x01, 0x00]).await;
        let mut buf = [0u8; 2];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("rejection is immediate");
        assert!(matches!(read, Ok(0) | Err(_)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn client_handshake_timeout_closes_socket() {
        let (remote, _opened) = spawn_echo_relay("server-test").await;
        let mut config = local_config(remote, FrontEndMode::Socks5);
        config.client_handshake_timeout = Duration::from_millis(100);
        let handle = start(config).await.expect("start");

        let mut idle = TcpStream::connect(handle.local_addrs()[0]).await.expect("connect");
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), idle.read(&mut buf))
            .await
            .expect("closed by timeout");
        assert!(matches!(read, Ok(0) | Err(_)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_listeners() {
        let (remote, _opened) = spawn_echo_relay("server-test").await;
        let handle = start(local_config(remote, FrontEndMode::Mixed))
            .await
            .expect("start");
        let addr = handle.local_addrs()[0];

        handle.shutdown().await;
        TcpAcceptor::bind(&addr.to_string())
            .await
            .expect("address is free again");
    }

    #[tokio::test]
    async fn invalid_config_fails_to_start() {
        let config = LocalConfig::new("");
        assert!(matches!(start(config).await, Err(LocalError::Config(_))));
    }
}
