//! Front-end adapters: one enum over the proxy protocols a port can speak.

use bytes::Bytes;
use cipher_relay_peer::{Destination, PeerError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{FrontEndMode, Socks5Auth};
use crate::error::{LocalError, Result};
use crate::http::{self, HttpTarget};
use crate::registry::Protocol;
use crate::socks5::{self, reply};

/// Proxy protocol chosen for one client connection.
#[derive(Debug, Clone)]
pub enum FrontEnd {
    Socks5 { auth: Option<Socks5Auth> },
    Http,
}

/// What the client asked for once its handshake is read.
#[derive(Debug)]
pub enum ClientRequest {
    /// Relay to a destination.
    Relay(RelayRequest),
    /// An HTTP request addressed to the proxy itself.
    Local { version: String, path: String },
}

impl FrontEnd {
    /// Pick the adapter for a listener mode. A mixed port looks at the first
    /// byte without consuming it: `0x05` is SOCKS5, anything else is HTTP.
    pub async fn detect(
        mode: FrontEndMode,
        auth: Option<&Socks5Auth>,
        socket: &TcpStream,
    ) -> Result<Self> {
        let socks = || FrontEnd::Socks5 {
            auth: auth.cloned(),
        };
        match mode {
            FrontEndMode::Socks5 => Ok(socks()),
            FrontEndMode::Http => Ok(FrontEnd::Http),
            FrontEndMode::Mixed => {
                let mut first = [0u8; 1];
                if socket.peek(&mut first).await? == 0 {
                    return Err(LocalError::Protocol(
                        "connection closed before handshake".to_string(),
                    ));
                }
                if first[0] == socks5::SOCKS_VERSION {
                    Ok(socks())
                } else {
                    Ok(FrontEnd::Http)
                }
            }
        }
    }

    /// Read the client's handshake up to the point where a relay stream is
    /// needed. Malformed input is answered with the protocol's failure reply.
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<ClientRequest>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            FrontEnd::Socks5 { auth } => {
                let destination = socks5::accept_request(stream, auth.as_ref()).await?;
                Ok(ClientRequest::Relay(RelayRequest {
                    destination,
                    reply: ReplyStyle::Socks5,
                    replay: Bytes::new(),
                }))
            }
            FrontEnd::Http => {
                let request = match http::read_request(stream).await {
                    Ok(request) => request,
                    Err(err @ LocalError::Protocol(_)) => {
                        let _ = http::send_status(stream, "HTTP/1.1", 400, "Bad Request").await;
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                };
                let version = request.version.clone();
                Ok(match request.target.clone() {
                    HttpTarget::Tunnel(destination) => ClientRequest::Relay(RelayRequest {
                        destination,
                        replay: request.leftover(),
                        reply: ReplyStyle::Tunnel { version },
                    }),
                    HttpTarget::Forward(destination) => ClientRequest::Relay(RelayRequest {
                        destination,
                        replay: request.buffered(),
                        reply: ReplyStyle::Forward { version },
                    }),
                    HttpTarget::Local(path) => ClientRequest::Local { version, path },
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
enum ReplyStyle {
    Socks5,
    Tunnel { version: String },
    Forward { version: String },
}

/// A parsed request waiting for its relay stream.
#[derive(Debug)]
pub struct RelayRequest {
    destination: Destination,
    reply: ReplyStyle,
    replay: Bytes,
}

impl RelayRequest {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn protocol(&self) -> Protocol {
        match self.reply {
            ReplyStyle::Socks5 => Protocol::Socks5,
            ReplyStyle::Tunnel { .. } => Protocol::HttpConnect,
            ReplyStyle::Forward { .. } => Protocol::HttpForward,
        }
    }

    /// Client bytes already consumed that must be sent down the stream first.
    pub fn replay(&self) -> Bytes {
        self.replay.clone()
    }

    /// Tell the client the stream is open. A forwarded HTTP request gets no
    /// reply of its own; the destination's response follows.
    pub async fn reply_success<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match &self.reply {
            ReplyStyle::Socks5 => socks5::send_reply(stream, reply::SUCCEEDED).await,
            ReplyStyle::Tunnel { version } => http::send_established(stream, version).await,
            ReplyStyle::Forward { .. } => Ok(()),
        }
    }

    /// Tell the client the stream could not be opened.
    pub async fn reply_failure<S>(&self, stream: &mut S, err: &LocalError) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match &self.reply {
            ReplyStyle::Socks5 => socks5::send_reply(stream, socks_failure_code(err)).await,
            ReplyStyle::Tunnel { version } | ReplyStyle::Forward { version } => {
                let (code, reason) = http_failure_status(err);
                http::send_status(stream, version, code, reason).await
            }
        }
    }
}

/// SOCKS5 reply code for a failed stream open.
pub fn socks_failure_code(err: &LocalError) -> u8 {
    match err {
        LocalError::Peer(PeerError::RemoteRefused { .. } | PeerError::OpenTimeout(_)) => {
            reply::CONNECTION_REFUSED
        }
        LocalError::Peer(PeerError::Connect(_) | PeerError::PeerUnreachable(_)) => {
            reply::NETWORK_UNREACHABLE
        }
        _ => reply::GENERAL_FAILURE,
    }
}

/// HTTP status for a failed stream open.
pub fn http_failure_status(err: &LocalError) -> (u16, &'static str) {
    match err {
        LocalError::ShuttingDown
        | LocalError::Peer(PeerError::ConnectionUnavailable(_)) => (503, "Service Unavailable"),
        LocalError::Peer(PeerError::OpenTimeout(_)) => (504, "Gateway Timeout"),
        _ => (502, "Bad Gateway"),
    }
}
