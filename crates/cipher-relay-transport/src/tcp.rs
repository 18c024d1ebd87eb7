use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// A bound TCP listening socket.
///
/// Used both for local proxy ports and for the remote relay port. Accepted
/// streams have `TCP_NODELAY` set since the relay forwards small interactive
/// writes as soon as they arrive.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind and listen on `addr` (`host:port`, port 0 picks a free port).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        info!(%local_addr, "listening on tcp socket");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next inbound connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted connection");
        Ok((stream, peer))
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Connect to `addr` (`host:port`), failing after `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let attempt = TcpStream::connect(addr);
    let stream = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            })
        }
    };
    stream.set_nodelay(true)?;
    debug!(addr, "connected");
    Ok(stream)
}

/// Resolve and connect to `host`:`port`, failing after `timeout`.
///
/// IPv6 literals are bracketed before resolution.
pub async fn connect_host(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    connect(&addr, timeout).await
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn bind_accept_connect() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr();

        let client = tokio::spawn(async move {
            let mut stream = connect(&addr.to_string(), Duration::from_secs(2))
                .await
                .unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let (mut server, peer) = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(peer.ip().is_loopback());

        client.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_reports_address() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().to_string();
        drop(acceptor);

        let err = connect(&addr, Duration::from_secs(2)).await.unwrap_err();
        match err {
            TransportError::Connect { addr: reported, .. } => assert_eq!(reported, addr),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_error() {
        let first = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().to_string();

        let result = TcpAcceptor::bind(&addr).await;
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }

    #[tokio::test]
    async fn connect_host_brackets_ipv6_literal() {
        let acceptor = match TcpAcceptor::bind("[::1]:0").await {
            Ok(acceptor) => acceptor,
            // No IPv6 loopback in this environment.
            Err(_) => return,
        };
        let port = acceptor.local_addr().port();

        let accept = tokio::spawn(async move { acceptor.accept().await.map(|_| ()) });
        connect_host("::1", port, Duration::from_secs(2)).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[test]
    fn timeout_error_kind() {
        let err = TransportError::ConnectTimeout {
            addr: "10.0.0.1:1".to_string(),
            timeout: Duration::from_millis(5),
        };
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::TimedOut));
    }
}
