//! Direct links between fleece workers.
//!
//! Each worker runs one [`Peer`]. It registers with the relay (`fleece-road`),
//! negotiates a transport to every worker it talks to, and exposes each link
//! as a [`Connection`] carrying request/response calls. Calls a worker makes
//! to itself never touch the network.

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use channel::{Connection, Inward, Outward, SelfConnection};
pub use config::PeerConfig;
pub use connection::{ConnectionState, PeerConnection};
pub use error::NetworkError;
pub use handler::{Handler, HandlerFault, HandlerRegistry, HandlerRegistryBuilder, HandlerResult};
pub use peer::Peer;
pub use signaling::RelaySender;
pub use transport::{MemoryNetwork, MemoryProvider, TransportProvider, WebRtcProvider};

pub use fleece_proto::{IceServerConfig, Response, WorkerId};
