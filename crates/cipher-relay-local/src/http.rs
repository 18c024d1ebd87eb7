//! HTTP proxy request heads: `CONNECT` tunnels, absolute-URI forwarding,
//! and origin-form requests answered locally.

use std::net::{IpAddr, SocketAddr};

use bytes::{Bytes, BytesMut};
use cipher_relay_peer::Destination;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LocalError, Result};

/// Largest request head accepted before giving up.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

const DEFAULT_HTTP_PORT: u16 = 80;

/// What the client asked the proxy to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpTarget {
    /// `CONNECT host:port`: open a raw tunnel.
    Tunnel(Destination),
    /// `GET http://host/...`: forward the request as-is.
    Forward(Destination),
    /// `GET /path`: a request addressed to the proxy itself.
    Local(String),
}

/// A parsed request head plus everything read from the socket so far.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub version: String,
    pub target: HttpTarget,
    buffered: Bytes,
    head_len: usize,
}

impl HttpRequest {
    /// Every byte read from the client, head included.
    pub fn buffered(&self) -> Bytes {
        self.buffered.clone()
    }

    /// Bytes read past the end of the head.
    pub fn leftover(&self) -> Bytes {
        self.buffered.slice(self.head_len..)
    }
}

/// Read and parse one request head.
pub async fn read_request<S>(stream: &mut S) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let head_len = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(LocalError::Protocol(format!(
                "request head exceeds {MAX_HEAD_SIZE} bytes"
            )));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(LocalError::Protocol(
                "connection closed before end of request head".to_string(),
            ));
        }
    };
    parse_request(buf.freeze(), head_len)
}

/// Offset just past the first blank line, whether lines end in CRLF or LF.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(pos, &byte)| {
        if byte != b'\n' {
            return None;
        }
        match &buf[pos + 1..] {
            [b'\n', ..] => Some(pos + 2),
            [b'\r', b'\n', ..] => Some(pos + 3),
            _ => None,
        }
    })
}

fn parse_request(buffered: Bytes, head_len: usize) -> Result<HttpRequest> {
    let head = std::str::from_utf8(&buffered[..head_len])
        .map_err(|_| LocalError::Protocol("request head is not utf-8".to_string()))?;
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(LocalError::Protocol(format!("bad request line {line:?}")));
    };
    if !version.starts_with("HTTP/") {
        return Err(LocalError::Protocol(format!("bad http version {version:?}")));
    }

    let target = if method.eq_ignore_ascii_case("CONNECT") {
        HttpTarget::Tunnel(parse_authority(uri, None)?)
    } else if let Some(rest) = strip_prefix_ignore_case(uri, "http://") {
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        HttpTarget::Forward(parse_authority(authority, Some(DEFAULT_HTTP_PORT))?)
    } else if uri.starts_with('/') {
        HttpTarget::Local(uri.to_string())
    } else {
        return Err(LocalError::Protocol(format!("unsupported request target {uri:?}")));
    };

    Ok(HttpRequest {
        method: method.to_string(),
        version: version.to_string(),
        target,
        buffered,
        head_len,
    })
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Parse `host:port`, `[v6]:port`, or a bare host when `default_port` is set.
pub fn parse_authority(authority: &str, default_port: Option<u16>) -> Result<Destination> {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let bad = || LocalError::Protocol(format!("bad authority {authority:?}"));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => return Err(bad()),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| bad())?,
        None => default_port.ok_or_else(bad)?,
    };
    if host.is_empty() {
        return Err(bad());
    }
    Ok(match host.parse::<IpAddr>() {
        Ok(ip) => Destination::Ip(SocketAddr::new(ip, port)),
        Err(_) => Destination::Domain(host.to_string(), port),
    })
}

/// `200 Connection Established` for a tunnel.
pub async fn send_established<S>(stream: &mut S, version: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let line = format!("{version} 200 Connection Established\r\n\r\n");
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// A body-less status response that closes the connection.
pub async fn send_status<S>(stream: &mut S, version: &str, code: u16, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response =
        format!("{version} {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// A `200 OK` plain-text response.
pub async fn send_text<S>(stream: &mut S, version: &str, body: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "{version} 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
