//! Inbound connections and their pending output
//!
//! A connection is split in two:
//! - [`Connection`] owns the socket and lives on its dispatch loop thread.
//! - [`PeerSlot`] is shared with worker jobs and holds at most one pending
//!   [`Reply`]. Workers offer a reply, the write path takes it.

use crate::handshake::HandshakeBundle;
use crate::network::buffer_pool::PooledBuffer;
use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

/// Size of the scratch buffer used to drain bytes beyond the chunk cap
const DISCARD_BUF_LEN: usize = 4096;

/// Output owed to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// One serialized envelope
    Single(Bytes),
    /// `version` + `verack`, which must leave in one write
    HandshakeBundle(HandshakeBundle),
}

impl Reply {
    pub fn is_handshake(&self) -> bool {
        matches!(self, Reply::HandshakeBundle(_))
    }

    /// Bytes to put on the socket
    pub fn into_wire(self) -> Bytes {
        match self {
            Reply::Single(bytes) => bytes,
            Reply::HandshakeBundle(bundle) => bundle.wire_bytes(),
        }
    }
}

/// Shared identity and pending-output slot of one connection
#[derive(Debug)]
pub struct PeerSlot {
    token: Token,
    peer: SocketAddr,
    pending: Mutex<Option<Reply>>,
}

impl PeerSlot {
    pub fn new(token: Token, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            token,
            peer,
            pending: Mutex::new(None),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Store `reply` if nothing is pending; otherwise hand it back
    pub fn offer(&self, reply: Reply) -> Result<(), Reply> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_some() {
            return Err(reply);
        }
        *pending = Some(reply);
        Ok(())
    }

    /// Remove the pending reply for writing
    pub fn take(&self) -> Option<Reply> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// What one readable event produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Peer closed its side of the stream
    pub eof: bool,
    /// Bytes read past the chunk cap and thrown away
    pub discarded: usize,
}

/// What one writable event achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Idle,
    /// A reply went out completely
    Written { handshake: bool },
    /// The socket filled up; the rest waits for the next writable event
    Blocked,
}

/// Socket side of a connection, owned by one dispatch loop
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    slot: Arc<PeerSlot>,
    /// Partially written reply
    outbox: Option<(Bytes, bool)>,
    peer_closed: bool,
    write_interest: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, slot: Arc<PeerSlot>) -> Self {
        Self {
            stream,
            slot,
            outbox: None,
            peer_closed: false,
            write_interest: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn slot(&self) -> &Arc<PeerSlot> {
        &self.slot
    }

    pub fn peer(&self) -> SocketAddr {
        self.slot.peer()
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn set_write_interest(&mut self, enabled: bool) {
        self.write_interest = enabled;
    }

    /// True while any output is queued or half-written
    pub fn has_output(&self) -> bool {
        self.outbox.is_some() || self.slot.is_pending()
    }

    /// Drain the socket into `buf`, keeping at most `max` bytes
    ///
    /// Readiness is edge-triggered, so the socket is read until it would
    /// block. Anything past `max` is read and dropped.
    pub fn read_chunk(&mut self, buf: &mut PooledBuffer, max: usize) -> io::Result<ReadOutcome> {
        let mut scratch = [0u8; DISCARD_BUF_LEN];
        let mut outcome = ReadOutcome {
            eof: false,
            discarded: 0,
        };

        loop {
            let result = if buf.len() < max {
                let start = buf.len();
                buf.resize(max, 0);
                let result = self.stream.read(&mut buf[start..]);
                let filled = *result.as_ref().unwrap_or(&0);
                buf.truncate(start + filled);
                result
            } else {
                self.stream.read(&mut scratch).map(|n| {
                    outcome.discarded += n;
                    n
                })
            };

            match result {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if outcome.eof {
            self.peer_closed = true;
        }
        Ok(outcome)
    }

    /// Write the pending reply, resuming a half-written one first
    pub fn flush(&mut self) -> io::Result<FlushOutcome> {
        if self.outbox.is_none() {
            match self.slot.take() {
                Some(reply) => {
                    let handshake = reply.is_handshake();
                    self.outbox = Some((reply.into_wire(), handshake));
                }
                None => return Ok(FlushOutcome::Idle),
            }
        }

        let Some((bytes, handshake)) = self.outbox.as_mut() else {
            return Ok(FlushOutcome::Idle);
        };

        while bytes.has_remaining() {
            match self.stream.write(bytes.chunk()) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => bytes.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(FlushOutcome::Blocked),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let handshake = *handshake;
        self.outbox = None;
        Ok(FlushOutcome::Written { handshake })
    }

    pub fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                log::debug!("Shutdown of {} failed: {}", self.peer(), e);
            }
        }
    }
}
