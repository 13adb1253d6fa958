//! Connection acceptance and loop assignment

use crate::network::registry::LoopRegistry;
use crate::network::stats::EngineStats;
use mio::net::TcpListener;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

/// Round-robin choice of dispatch loop
#[derive(Debug, Clone)]
pub struct RoundRobin {
    next: usize,
    len: usize,
}

impl RoundRobin {
    pub fn new(len: usize) -> Self {
        Self {
            next: 0,
            len: len.max(1),
        }
    }

    /// Index the next accepted connection goes to
    pub fn peek(&self) -> usize {
        self.next
    }

    /// Move on after a connection was assigned
    pub fn advance(&mut self) {
        self.next = (self.next + 1) % self.len;
    }
}

/// Turns listener readiness into connections queued on dispatch loops
///
/// Only the main loop thread calls [`Acceptor::accept`].
pub struct Acceptor {
    registry: Arc<LoopRegistry>,
    stats: Arc<EngineStats>,
}

impl Acceptor {
    pub fn new(registry: Arc<LoopRegistry>, stats: Arc<EngineStats>) -> Self {
        Self { registry, stats }
    }

    /// Accept one connection and hand it to loop `loop_index`
    ///
    /// `Ok(None)` means nothing was waiting. A connection that cannot be
    /// queued is logged and dropped; it still counts as accepted.
    pub fn accept(&self, loop_index: usize, listener: &TcpListener) -> io::Result<Option<SocketAddr>> {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        self.stats.record_accept();

        // mio hands out non-blocking sockets already.
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not disable Nagle for {}: {}", peer, e);
        }

        match self.registry.enqueue(loop_index, stream, peer) {
            Ok(()) => {
                self.stats.record_assignment(loop_index);
                log::info!("Accepted {} on loop {}", peer, loop_index);
                if let Err(e) = self.registry.wake(loop_index) {
                    log::warn!("Failed to wake loop {}: {}", loop_index, e);
                }
            }
            Err(e) => {
                self.stats.record_enqueue_failure();
                log::warn!("Dropping connection from {}: {}", peer, e);
            }
        }
        Ok(Some(peer))
    }
}
