//! Authenticated transport connections and stream multiplexing.
//!
//! A transport connection is one TCP socket between a local and a remote
//! relay. It starts with a key-confirmation handshake, after which every frame
//! payload is sealed with the connection's cipher session. Logical streams,
//! one per proxied client connection, are multiplexed over it with
//! credit-based flow control.
//!
//! The dialing side pools connections through [`ConnectionManager`]; the
//! accepting side uses [`RelayListener`].

pub mod connection;
pub mod connector;
pub mod control;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod mux;
pub mod splice;
pub mod stream;

pub use connection::{TransportConnection, WireCounters};
pub use connector::{connect, ConnectionManager, ConnectorConfig};
pub use control::{decode_credit, encode_credit, CloseReason, Destination};
pub use error::{PeerError, Result};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, MAGIC, PROTOCOL_VERSION,
};
pub use listener::{PendingPeer, RelayListener};
pub use mux::{Multiplexer, MuxConfig, MuxRole, StreamPhase};
pub use splice::{splice, TrafficCounters};
pub use stream::{IncomingStreams, StreamHandle};
