//! Local side of cipher-relay.
//!
//! Accepts SOCKS5 and HTTP proxy clients, opens a logical stream per client
//! through a pooled, encrypted transport connection to the remote relay, and
//! splices bytes between the two. [`start`] binds the configured listeners and
//! returns a [`RunningHandle`]; [`RunningHandle::shutdown`] drains and stops.

pub mod adapter;
pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod server;
pub mod socks5;
pub mod supervisor;

pub use adapter::{ClientRequest, FrontEnd, RelayRequest};
pub use config::{
    FrontEndMode, ListenerConfig, LocalConfig, Socks5Auth, DEFAULT_LISTEN_ADDR,
    DEFAULT_REMOTE_ADDR,
};
pub use error::{LocalError, Result};
pub use registry::{
    ConnectionRegistry, ConnectionStat, DestinationStat, Protocol, StatsSnapshot,
};
pub use server::{start, RunningHandle};
pub use supervisor::{Admission, Supervisor};
