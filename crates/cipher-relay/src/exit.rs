use std::fmt;
use std::io;

use cipher_relay_cipher::CipherError;
use cipher_relay_local::LocalError;
use cipher_relay_peer::PeerError;
use cipher_relay_remote::RemoteError;
use cipher_relay_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other @ TransportError::ConnectTimeout { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {other}"))
        }
    }
}

pub fn cipher_error(context: &str, err: CipherError) -> CliError {
    match err {
        CipherError::EmptySecret => CliError::new(USAGE, format!("{context}: {err}")),
        CipherError::AuthenticationFailure => {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn peer_error(context: &str, err: PeerError) -> CliError {
    match err {
        PeerError::Connect(_) | PeerError::PeerUnreachable(_) | PeerError::HandshakeFailed(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        PeerError::AuthenticationFailure => {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        PeerError::OpenTimeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        PeerError::MalformedFrame(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn local_error(context: &str, err: LocalError) -> CliError {
    match err {
        LocalError::Transport(err) => transport_error(context, err),
        LocalError::Peer(err) => peer_error(context, err),
        LocalError::Cipher(err) => cipher_error(context, err),
        LocalError::Io(err) => io_error(context, err),
        LocalError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn remote_error(context: &str, err: RemoteError) -> CliError {
    match err {
        RemoteError::Transport(err) => transport_error(context, err),
        RemoteError::Peer(err) => peer_error(context, err),
        RemoteError::Cipher(err) => cipher_error(context, err),
        RemoteError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_conflict_is_transport_error() {
        let err = TransportError::Bind {
            addr: "127.0.0.1:9527".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        let cli = local_error("start failed", LocalError::Transport(err));
        assert_eq!(cli.code, TRANSPORT_ERROR);
        assert!(cli.message.starts_with("start failed: "));
    }

    #[test]
    fn config_errors_are_usage() {
        let cli = remote_error("start failed", RemoteError::Config("bad".to_string()));
        assert_eq!(cli.code, USAGE);
        let cli = local_error("start failed", LocalError::Cipher(CipherError::EmptySecret));
        assert_eq!(cli.code, USAGE);
    }

    #[test]
    fn authentication_failure_is_permission_denied() {
        let cli = peer_error("relay", PeerError::AuthenticationFailure);
        assert_eq!(cli.code, PERMISSION_DENIED);
    }
}
