//! TCP transport primitives for cipher-relay.
//!
//! This is the lowest layer of the relay. It binds local proxy ports and the
//! remote relay port, accepts inbound sockets, and dials outbound ones with a
//! bounded connect time. Everything above works on plain `tokio::net::TcpStream`s
//! produced here.

pub mod error;
pub mod tcp;

pub use error::{Result, TransportError};
pub use tcp::{connect, connect_host, TcpAcceptor};
