//! Network engine errors

use crate::protocol::WireError;
use std::io;
use thiserror::Error;

/// Errors raised by the engine, its workers and outbound clients
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Unhandled command: {0}")]
    UnhandledCommand(String),
    #[error("Reply already pending for {0}")]
    ReplyPending(String),
    #[error("Worker pool is shut down")]
    PoolClosed,
    #[error("Incoming queue for loop {0} is full")]
    QueueFull(usize),
    #[error("No dispatch loop with index {0}")]
    UnknownLoop(usize),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Peer disconnected")]
    Disconnected,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type NodeResult<T> = Result<T, NodeError>;
