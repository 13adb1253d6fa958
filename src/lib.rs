//! Wire-Node: an event-driven peer server for a Bitcoin-style wire protocol
//!
//! This crate provides:
//! - Envelope framing with network magic, command name and SHA-256d checksum
//! - The version/verack handshake, from both the initiating and responding side
//! - A time-bounded cache of completed handshakes
//! - A main loop that accepts connections and spreads them over N dispatch loops
//! - Per-loop worker pools that turn request chunks into replies
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use wire_node::handshake::{ConnectionCache, Initiator};
//! use wire_node::network::{NodeConfig, PeerClient, Server};
//! use wire_node::protocol::{NetworkType, VersionMessage};
//! use std::sync::Arc;
//!
//! // Start a server on an OS-assigned port
//! let config = NodeConfig {
//!     port: 0,
//!     ..NodeConfig::for_network(NetworkType::Regtest)
//! };
//! let server = Server::bind(config).unwrap().spawn().unwrap();
//!
//! // Handshake with it
//! let addr = server.local_addr();
//! let mut client = PeerClient::connect(
//!     &addr.to_string(),
//!     NetworkType::Regtest,
//!     Duration::from_secs(5),
//!     Duration::from_secs(5),
//! )
//! .unwrap();
//! let mut initiator = Initiator::new(
//!     NetworkType::Regtest,
//!     VersionMessage::new(Some(addr), "/example/", 0),
//!     Arc::new(ConnectionCache::new()),
//!     Duration::from_secs(60),
//!     Duration::from_millis(100),
//! );
//! assert!(initiator.perform(&mut client).unwrap());
//!
//! server.join().unwrap();
//! ```

pub mod crypto;
pub mod handshake;
pub mod network;
pub mod protocol;

// Re-export commonly used types
pub use handshake::{ConnectionCache, HandshakeBundle, HandshakeState, Initiator, Responder};
pub use network::{
    ConfigError, NodeConfig, NodeError, NodeResult, PeerChannel, PeerClient, Server, ServerHandle,
    StatsSnapshot,
};
pub use protocol::{Command, Envelope, EnvelopeCodec, NetworkType, VersionMessage, WireError};
