//! SOCKS5 server handshake (RFC 1928, RFC 1929 username/password).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use cipher_relay_peer::Destination;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::Socks5Auth;
use crate::error::{LocalError, Result};

pub const SOCKS_VERSION: u8 = 0x05;

const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes.
pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Run greeting, optional authentication and request parsing.
///
/// Protocol-level refusals (auth method, command, address type) are answered
/// here before the error is returned. The CONNECT reply itself is sent by the
/// caller with [`send_reply`] once the relay stream is open.
pub async fn accept_request<S>(stream: &mut S, auth: Option<&Socks5Auth>) -> Result<Destination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, auth).await?;
    read_request(stream).await
}

async fn negotiate_method<S>(stream: &mut S, auth: Option<&Socks5Auth>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(LocalError::UnsupportedVersion(header[0]));
    }
    let mut methods = vec![0u8; usize::from(header[1])];
    stream.read_exact(&mut methods).await?;

    let wanted = if auth.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(LocalError::UnsupportedAuth);
    }
    stream.write_all(&[SOCKS_VERSION, wanted]).await?;

    if let Some(auth) = auth {
        authenticate(stream, auth).await?;
    }
    Ok(())
}

async fn authenticate<S>(stream: &mut S, auth: &Socks5Auth) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != AUTH_VERSION {
        return Err(LocalError::Protocol(format!(
            "bad auth subnegotiation version {}",
            version[0]
        )));
    }
    let username = read_short_string(stream).await?;
    let password = read_short_string(stream).await?;

    let ok = username == auth.username.as_bytes() && password == auth.password.as_bytes();
    stream
        .write_all(&[AUTH_VERSION, if ok { 0x00 } else { 0x01 }])
        .await?;
    if !ok {
        debug!(username = %String::from_utf8_lossy(&username), "SOCKS5 credentials rejected");
        return Err(LocalError::AuthFailed);
    }
    Ok(())
}

async fn read_short_string<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut value = vec![0u8; usize::from(len[0])];
    stream.read_exact(&mut value).await?;
    Ok(value)
}

async fn read_request<S>(stream: &mut S) -> Result<Destination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != SOCKS_VERSION {
        send_reply(stream, reply::GENERAL_FAILURE).await?;
        return Err(LocalError::UnsupportedVersion(version));
    }
    if command != CMD_CONNECT {
        send_reply(stream, reply::COMMAND_NOT_SUPPORTED).await?;
        return Err(LocalError::CommandNotSupported(command));
    }

    let destination = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Destination::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Destination::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let host = read_short_string(stream).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            let Ok(host) = String::from_utf8(host) else {
                send_reply(stream, reply::GENERAL_FAILURE).await?;
                return Err(LocalError::Protocol("domain is not utf-8".to_string()));
            };
            if host.is_empty() {
                send_reply(stream, reply::GENERAL_FAILURE).await?;
                return Err(LocalError::Protocol("empty domain".to_string()));
            }
            Destination::Domain(host, u16::from_be_bytes(port))
        }
        other => {
            send_reply(stream, reply::ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(LocalError::AddressTypeNotSupported(other));
        }
    };
    Ok(destination)
}

/// Send a reply with an unspecified IPv4 bound address.
pub async fn send_reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}
