//! Peer networking engine
//!
//! Provides the event-driven server side of the wire protocol.
//!
//! # Features
//! - One main loop accepting connections and spreading them round-robin
//! - N dispatch loops, each multiplexing its own connections
//! - Per-loop worker pools that grow under load and fall back to caller-runs
//! - One pending reply per connection, written when the socket is writable
//! - Blocking outbound clients for handshakes and pings

pub mod acceptor;
pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod processor;
pub mod registry;
pub mod server;
pub mod stats;
pub mod worker_pool;

pub use acceptor::{Acceptor, RoundRobin};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use client::{PeerChannel, PeerClient, DEFAULT_EXCHANGE_ATTEMPTS, READ_CHUNK_SIZE};
pub use config::{NodeConfig, DEFAULT_DISPATCH_LOOPS, DEFAULT_MAX_CHUNK_SIZE};
pub use connection::{Connection, PeerSlot, Reply};
pub use dispatch::DispatchLoop;
pub use error::{ConfigError, NodeError, NodeResult};
pub use processor::{ProcessorContext, RequestProcessor};
pub use registry::{LoopHandle, LoopRegistry, WAKE_TOKEN};
pub use server::{Server, ServerHandle, ShutdownHandle};
pub use stats::{EngineStats, StatsSnapshot};
pub use worker_pool::WorkerPool;
