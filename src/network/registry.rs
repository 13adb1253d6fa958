//! Per-loop hand-off points
//!
//! Fixed-size, indexed by dispatch loop. For each loop the registry holds
//! the waker of its multiplexer, the sending half of its incoming-connection
//! queue, and the queue of connections that need write interest armed.
//! Only the owning loop ever touches its multiplexer; everyone else goes
//! through these queues and then wakes the loop.

use crate::network::error::NodeError;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::queue::SegQueue;
use mio::net::TcpStream;
use mio::{Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Token reserved for each multiplexer's waker
pub const WAKE_TOKEN: Token = Token(0);

/// A freshly accepted connection on its way to a dispatch loop
pub type Incoming = (TcpStream, SocketAddr);

/// Wakers and queues for every dispatch loop
pub struct LoopRegistry {
    wakers: Box<[Waker]>,
    incoming: Box<[Sender<Incoming>]>,
    rearm: Box<[SegQueue<Token>]>,
}

impl LoopRegistry {
    /// Build one entry per multiplexer; returns the consumer ends of the
    /// incoming queues in loop order
    pub fn build(
        polls: &[Poll],
        queue_capacity: usize,
    ) -> io::Result<(Arc<Self>, Vec<Receiver<Incoming>>)> {
        let mut wakers = Vec::with_capacity(polls.len());
        let mut senders = Vec::with_capacity(polls.len());
        let mut receivers = Vec::with_capacity(polls.len());
        let mut rearm = Vec::with_capacity(polls.len());

        for poll in polls {
            wakers.push(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let (tx, rx) = channel::bounded(queue_capacity.max(1));
            senders.push(tx);
            receivers.push(rx);
            rearm.push(SegQueue::new());
        }

        let registry = Self {
            wakers: wakers.into_boxed_slice(),
            incoming: senders.into_boxed_slice(),
            rearm: rearm.into_boxed_slice(),
        };
        Ok((Arc::new(registry), receivers))
    }

    /// Number of dispatch loops
    pub fn len(&self) -> usize {
        self.wakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wakers.is_empty()
    }

    /// Queue a connection for loop `index`
    ///
    /// On failure the connection is dropped here, which closes its socket.
    pub fn enqueue(&self, index: usize, stream: TcpStream, peer: SocketAddr) -> Result<(), NodeError> {
        let sender = self.incoming.get(index).ok_or(NodeError::UnknownLoop(index))?;
        match sender.try_send((stream, peer)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(NodeError::QueueFull(index))
            }
        }
    }

    /// Interrupt loop `index`'s multiplexer wait
    pub fn wake(&self, index: usize) -> Result<(), NodeError> {
        let waker = self.wakers.get(index).ok_or(NodeError::UnknownLoop(index))?;
        waker.wake()?;
        Ok(())
    }

    pub fn wake_all(&self) {
        for (index, waker) in self.wakers.iter().enumerate() {
            if let Err(e) = waker.wake() {
                log::warn!("Failed to wake dispatch loop {}: {}", index, e);
            }
        }
    }

    /// Ask loop `index` to arm write interest for `token`
    pub fn request_write(&self, index: usize, token: Token) -> Result<(), NodeError> {
        let queue = self.rearm.get(index).ok_or(NodeError::UnknownLoop(index))?;
        queue.push(token);
        self.wake(index)
    }

    /// Next connection of loop `index` waiting for write interest
    pub fn next_write_request(&self, index: usize) -> Option<Token> {
        self.rearm.get(index)?.pop()
    }
}

/// One loop's view of the registry, handed to its worker jobs
#[derive(Clone)]
pub struct LoopHandle {
    index: usize,
    registry: Arc<LoopRegistry>,
}

impl LoopHandle {
    pub fn new(index: usize, registry: Arc<LoopRegistry>) -> Self {
        Self { index, registry }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Arm write interest for `token` and wake the loop
    pub fn request_write(&self, token: Token) -> Result<(), NodeError> {
        self.registry.request_write(self.index, token)
    }

    pub fn next_write_request(&self) -> Option<Token> {
        self.registry.next_write_request(self.index)
    }
}
