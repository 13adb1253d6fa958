//! Dispatch loops
//!
//! Each loop owns one multiplexer, the connections assigned to it and a
//! bounded worker pool. One turn of the loop:
//! 1. wait for readiness, bounded by the select timeout
//! 2. read ready sockets and hand each chunk to the worker pool
//! 3. flush pending replies on write-ready sockets
//! 4. arm write interest for connections whose jobs finished
//! 5. register connections queued by the acceptor

use crate::network::buffer_pool::BufferPool;
use crate::network::config::NodeConfig;
use crate::network::connection::{Connection, FlushOutcome, PeerSlot};
use crate::network::error::NodeError;
use crate::network::processor::{ProcessorContext, RequestProcessor};
use crate::network::registry::{Incoming, LoopHandle, LoopRegistry, WAKE_TOKEN};
use crate::network::stats::EngineStats;
use crate::network::worker_pool::WorkerPool;
use crossbeam::channel::Receiver;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Readiness events fetched per wait
const EVENTS_CAPACITY: usize = 1024;

/// One event loop servicing a disjoint subset of connections
pub struct DispatchLoop {
    index: usize,
    poll: Poll,
    incoming: Receiver<Incoming>,
    handle: LoopHandle,
    processor: RequestProcessor,
    pool: WorkerPool,
    buffers: Arc<BufferPool>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    max_chunk: usize,
    timeout: Duration,
    shutdown: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
}

impl DispatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        poll: Poll,
        incoming: Receiver<Incoming>,
        registry: Arc<LoopRegistry>,
        context: Arc<ProcessorContext>,
        config: &NodeConfig,
        shutdown: Arc<AtomicBool>,
        stats: Arc<EngineStats>,
    ) -> Result<Self, NodeError> {
        let (core, max) = config.worker_bounds();
        let pool = WorkerPool::new(format!("dispatch-{}", index), core, max, config.worker_backlog)?;
        let handle = LoopHandle::new(index, registry);
        let max_chunk = config.max_chunk_size.max(1);

        Ok(Self {
            index,
            poll,
            incoming,
            processor: RequestProcessor::new(context, handle.clone()),
            handle,
            pool,
            buffers: BufferPool::new(config.buffer_pool_size, max_chunk),
            connections: HashMap::new(),
            next_token: WAKE_TOKEN.0 + 1,
            max_chunk,
            timeout: config.select_timeout(),
            shutdown,
            stats,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Connections currently owned by this loop
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until the shutdown flag is raised
    pub fn run(mut self) -> Result<(), NodeError> {
        log::debug!("Dispatch loop {} started", self.index);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Err(e) = self.turn(&mut events) {
                break Err(e);
            }
        };

        self.pool.shutdown();
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, "shutting down");
        }
        self.pool.join();
        log::debug!("Dispatch loop {} stopped", self.index);
        result
    }

    /// One wait-and-service pass
    pub fn turn(&mut self, events: &mut Events) -> Result<(), NodeError> {
        match self.poll.poll(events, Some(self.timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if event.is_error() {
                self.close(token, "socket error");
                continue;
            }
            if event.is_readable() || event.is_read_closed() {
                self.on_readable(token);
            }
            if event.is_writable() {
                self.on_writable(token);
            }
        }

        self.arm_finished_jobs();
        self.register_incoming();
        Ok(())
    }

    fn on_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut chunk = self.buffers.acquire();
        let outcome = match conn.read_chunk(&mut chunk, self.max_chunk) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.close(token, &format!("read failed: {}", e));
                return;
            }
        };

        if outcome.discarded > 0 {
            log::warn!(
                "Discarded {} bytes from {} beyond the {}-byte chunk cap",
                outcome.discarded,
                conn.peer(),
                self.max_chunk
            );
        }

        if chunk.is_empty() {
            if outcome.eof {
                self.close(token, "peer closed");
            }
            return;
        }

        let slot = Arc::clone(conn.slot());
        self.stats.record_job();
        if let Err(e) = self.processor.submit(&self.pool, slot, chunk) {
            log::warn!("Loop {} could not queue request: {}", self.index, e);
        }
    }

    fn on_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        loop {
            match conn.flush() {
                Ok(FlushOutcome::Written { handshake }) => {
                    self.stats.record_reply();
                    if handshake {
                        self.processor.context().responder.record(&conn.peer());
                    }
                }
                Ok(FlushOutcome::Blocked) => return,
                Ok(FlushOutcome::Idle) => break,
                Err(e) => {
                    self.close(token, &format!("write failed: {}", e));
                    return;
                }
            }
        }

        if conn.peer_closed() {
            self.close(token, "peer closed");
        } else if conn.write_interest() {
            self.set_write_interest(token, false);
        }
    }

    /// Arm write interest for connections whose worker job finished
    fn arm_finished_jobs(&mut self) {
        while let Some(token) = self.handle.next_write_request() {
            let Some(conn) = self.connections.get(&token) else {
                continue;
            };
            if conn.has_output() {
                // Re-registering re-arms the edge even when write interest
                // was already set.
                self.set_write_interest(token, true);
            } else if conn.peer_closed() {
                self.close(token, "peer closed");
            }
        }
    }

    fn set_write_interest(&mut self, token: Token, enabled: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self
            .poll
            .registry()
            .reregister(conn.stream_mut(), token, interest)
        {
            Ok(()) => conn.set_write_interest(enabled),
            Err(e) => self.close(token, &format!("reregister failed: {}", e)),
        }
    }

    fn register_incoming(&mut self) {
        while let Ok((mut stream, peer)) = self.incoming.try_recv() {
            let token = Token(self.next_token);
            self.next_token += 1;

            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                log::warn!("Loop {} failed to register {}: {}", self.index, peer, e);
                continue;
            }
            log::debug!("Loop {} registered {} as {:?}", self.index, peer, token);
            self.connections
                .insert(token, Connection::new(stream, PeerSlot::new(token, peer)));
        }
    }

    fn close(&mut self, token: Token, reason: &str) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            log::debug!("Deregister of {} failed: {}", conn.peer(), e);
        }
        conn.shutdown();
        self.stats.record_close();
        log::debug!("Closed {} on loop {}: {}", conn.peer(), self.index, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{ConnectionCache, Responder};
    use crate::protocol::{Command, Envelope, EnvelopeCodec, NetworkType};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::time::Instant;

    const NETWORK: NetworkType = NetworkType::Regtest;

    struct Harness {
        dispatch: DispatchLoop,
        registry: Arc<LoopRegistry>,
        cache: Arc<ConnectionCache>,
        events: Events,
    }

    fn harness(max_chunk: usize) -> Harness {
        let config = NodeConfig {
            network: NETWORK,
            dispatch_loops: 1,
            max_chunk_size: max_chunk,
            select_timeout_ms: 20,
            ..Default::default()
        };
        let poll = Poll::new().unwrap();
        let (registry, mut receivers) = LoopRegistry::build(std::slice::from_ref(&poll), 8).unwrap();
        let cache = Arc::new(ConnectionCache::new());
        let responder = Responder::new(NETWORK, "/dispatch:test/", 0, Duration::from_secs(60), cache.clone());
        let context = Arc::new(ProcessorContext::new(NETWORK, responder));
        let dispatch = DispatchLoop::new(
            0,
            poll,
            receivers.remove(0),
            registry.clone(),
            context,
            &config,
            Arc::new(AtomicBool::new(false)),
            Arc::new(EngineStats::default()),
        )
        .unwrap();
        Harness {
            dispatch,
            registry,
            cache,
            events: Events::with_capacity(64),
        }
    }

    impl Harness {
        /// Hand a fresh loopback connection to the loop; returns the client end
        fn connect(&mut self) -> (TcpStream, SocketAddr) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            let (server, peer) = listener.accept().unwrap();
            server.set_nonblocking(true).unwrap();
            self.registry
                .enqueue(0, mio::net::TcpStream::from_std(server), peer)
                .unwrap();
            self.turn_until(|d| d.connection_count() == 1);
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            (client, peer)
        }

        fn turn_until(&mut self, done: impl Fn(&DispatchLoop) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(&self.dispatch) {
                assert!(Instant::now() < deadline, "dispatch loop made no progress");
                self.dispatch.turn(&mut self.events).unwrap();
            }
        }

        /// Turn the loop until `client` has `len` bytes to read
        fn read_reply(&mut self, client: &mut TcpStream, len: usize) -> Vec<u8> {
            client.set_nonblocking(true).unwrap();
            let mut received = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut buf = [0u8; 4096];
            while received.len() < len {
                assert!(Instant::now() < deadline, "no reply within deadline");
                self.dispatch.turn(&mut self.events).unwrap();
                match client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => panic!("client read failed: {}", e),
                }
            }
            client.set_nonblocking(false).unwrap();
            received
        }
    }

    #[test]
    fn test_ping_yields_pong_with_same_nonce() {
        let mut h = harness(64 * 1024);
        let (mut client, _) = h.connect();
        let nonce = 0xA1B2_C3D4_E5F6_0718u64;
        client.write_all(&Envelope::ping(NETWORK, nonce).to_bytes()).unwrap();

        let pong_len = Envelope::pong(NETWORK, nonce).wire_len();
        let reply = h.read_reply(&mut client, pong_len);
        let envelopes = EnvelopeCodec::new(NETWORK).parse_all(&reply);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].kind(), Command::Pong);
        assert_eq!(&envelopes[0].payload()[..], &nonce.to_le_bytes());
    }

    #[test]
    fn test_version_bundle_arrives_in_one_read_and_is_cached() {
        let mut h = harness(64 * 1024);
        let (mut client, peer) = h.connect();
        let version = crate::protocol::VersionMessage::new(None, "/client/", 0).to_envelope(NETWORK);
        client.write_all(&version.to_bytes()).unwrap();

        let expected_len = h
            .dispatch
            .processor
            .context()
            .responder
            .bundle_for(peer, &version)
            .wire_bytes()
            .len();
        let reply = h.read_reply(&mut client, expected_len);
        let commands: Vec<_> = EnvelopeCodec::new(NETWORK)
            .parse_all(&reply)
            .iter()
            .map(|e| e.kind())
            .collect();
        assert_eq!(commands, vec![Command::Version, Command::Verack]);
        assert!(h.cache.is_cached(&peer.to_string()));
    }

    #[test]
    fn test_peer_close_closes_connection() {
        let mut h = harness(64 * 1024);
        let (client, _) = h.connect();
        drop(client);
        h.turn_until(|d| d.connection_count() == 0);
    }

    #[test]
    fn test_bytes_beyond_cap_are_ignored() {
        let mut h = harness(HEADER_CAP);
        let (mut client, _) = h.connect();

        // The ping fits in the cap; the trailing noise does not.
        let mut bytes = Envelope::ping(NETWORK, 11).to_bytes().to_vec();
        bytes.extend_from_slice(&[0xEE; 512]);
        client.write_all(&bytes).unwrap();

        let pong_len = Envelope::pong(NETWORK, 11).wire_len();
        let reply = h.read_reply(&mut client, pong_len);
        let envelopes = EnvelopeCodec::new(NETWORK).parse_all(&reply);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].nonce(), Some(11));
        assert_eq!(h.dispatch.connection_count(), 1);
    }

    const HEADER_CAP: usize = crate::protocol::HEADER_LEN + crate::protocol::NONCE_LEN;
}
