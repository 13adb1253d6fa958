//! Node configuration

use crate::handshake::cache::DEFAULT_HANDSHAKE_TTL;
use crate::network::error::ConfigError;
use crate::protocol::{default_user_agent, NetworkType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default number of dispatch loops
pub const DEFAULT_DISPATCH_LOOPS: usize = 4;

/// Default cap on bytes processed from one readable event
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Worker pool ceiling as a multiple of the dispatch loop count
pub const WORKER_MAX_FACTOR: usize = 10;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network variant, selects magic and default port
    pub network: NetworkType,
    /// Interface to listen on
    pub listen_host: String,
    /// Port to listen on (0 = OS-assigned)
    pub port: u16,
    /// Number of dispatch loops (N)
    pub dispatch_loops: usize,
    /// Core workers per dispatch loop (defaults to N)
    pub worker_min: Option<usize>,
    /// Maximum workers per dispatch loop (defaults to 10N)
    pub worker_max: Option<usize>,
    /// Jobs queued per worker pool before extra workers spawn
    pub worker_backlog: usize,
    /// Capacity of each loop's incoming-connection queue
    pub incoming_queue_capacity: usize,
    /// Multiplexer wait bound in milliseconds
    pub select_timeout_ms: u64,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Outbound read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Bytes kept from one readable event; the rest is discarded
    pub max_chunk_size: usize,
    /// Number of reusable read buffers per dispatch loop
    pub buffer_pool_size: usize,
    /// Lifetime of a completed handshake in the connection cache
    pub handshake_ttl_secs: u64,
    /// Pause after the initiator sends its verack
    pub settle_delay_ms: u64,
    /// User agent advertised in `version`
    pub user_agent: String,
    /// Start height advertised in `version`
    pub start_height: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Main,
            listen_host: "0.0.0.0".to_string(),
            port: NetworkType::Main.default_port(),
            dispatch_loops: DEFAULT_DISPATCH_LOOPS,
            worker_min: None,
            worker_max: None,
            worker_backlog: 256,
            incoming_queue_capacity: 1024,
            select_timeout_ms: 500,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            buffer_pool_size: 64,
            handshake_ttl_secs: DEFAULT_HANDSHAKE_TTL.as_secs(),
            settle_delay_ms: 100,
            user_agent: default_user_agent(),
            start_height: 0,
        }
    }
}

impl NodeConfig {
    /// Defaults for `network`, including its default port
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            network,
            port: network.default_port(),
            ..Default::default()
        }
    }

    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path)?;
        let config: NodeConfig = serde_json::from_reader(BufReader::new(file))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Socket address to bind
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.listen_host.parse().map_err(|_| ConfigError::Invalid {
            field: "listen_host",
            reason: format!("'{}' is not an IP address", self.listen_host),
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Dispatch loop count, at least one
    pub fn loops(&self) -> usize {
        self.dispatch_loops.max(1)
    }

    /// (core, max) workers per dispatch loop
    pub fn worker_bounds(&self) -> (usize, usize) {
        let n = self.loops();
        let min = self.worker_min.unwrap_or(n).max(1);
        let max = self.worker_max.unwrap_or(n * WORKER_MAX_FACTOR).max(min);
        (min, max)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn handshake_ttl(&self) -> Duration {
        Duration::from_secs(self.handshake_ttl_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
