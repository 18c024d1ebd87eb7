//! Remote side of cipher-relay.
//!
//! Accepts encrypted transport connections from local relays, answers the
//! handshake, and serves each inbound stream by dialing its destination and
//! splicing bytes until either side closes.

pub mod config;
pub mod error;
pub mod server;

pub use config::{RemoteConfig, DEFAULT_LISTEN_ADDR};
pub use error::{RemoteError, Result};
pub use server::{start, RemoteHandle, RemoteStats};
