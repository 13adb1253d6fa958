//! Listening server and main loop
//!
//! The main loop owns the listening socket and its multiplexer. Each
//! accepted connection goes to the next dispatch loop in round-robin order
//! and stays there for its whole life.

use crate::handshake::{ConnectionCache, Responder};
use crate::network::acceptor::{Acceptor, RoundRobin};
use crate::network::config::NodeConfig;
use crate::network::dispatch::DispatchLoop;
use crate::network::error::{NodeError, NodeResult};
use crate::network::processor::ProcessorContext;
use crate::network::registry::{LoopRegistry, WAKE_TOKEN};
use crate::network::stats::{EngineStats, StatsSnapshot};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const LISTENER: Token = Token(1);

/// Shortest interval between connection cache sweeps
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Raises the interrupt flag and wakes the main loop
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            log::warn!("Failed to wake main loop: {}", e);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Bound, not yet running, peer server
pub struct Server {
    config: NodeConfig,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    cache: Arc<ConnectionCache>,
    stats: Arc<EngineStats>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind the listening socket; port 0 picks a free port
    pub fn bind(config: NodeConfig) -> NodeResult<Self> {
        let addr = config.listen_addr()?;
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let local_addr = listener.local_addr()?;
        let loops = config.loops();
        log::info!(
            "Listening on {} ({} network, {} dispatch loops)",
            local_addr,
            config.network,
            loops
        );

        Ok(Self {
            config,
            poll,
            listener,
            local_addr,
            cache: Arc::new(ConnectionCache::new()),
            stats: Arc::new(EngineStats::new(loops)),
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache(&self) -> Arc<ConnectionCache> {
        Arc::clone(&self.cache)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the engine on a background thread
    pub fn spawn(self) -> NodeResult<ServerHandle> {
        let local_addr = self.local_addr;
        let cache = self.cache();
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown_handle();
        let thread = thread::Builder::new()
            .name("main-loop".to_string())
            .spawn(move || self.run())?;

        Ok(ServerHandle {
            local_addr,
            cache,
            stats,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Start the dispatch loops and run the main loop until shut down
    pub fn run(mut self) -> NodeResult<()> {
        let loops = self.config.loops();
        let polls = (0..loops)
            .map(|_| Poll::new())
            .collect::<io::Result<Vec<_>>>()?;
        let (registry, receivers) =
            LoopRegistry::build(&polls, self.config.incoming_queue_capacity)?;

        let responder = Responder::new(
            self.config.network,
            self.config.user_agent.clone(),
            self.config.start_height,
            self.config.handshake_ttl(),
            Arc::clone(&self.cache),
        );
        let context = Arc::new(ProcessorContext::new(self.config.network, responder));

        let mut threads: Vec<JoinHandle<NodeResult<()>>> = Vec::with_capacity(loops);
        let mut started = Ok(());
        for (index, (poll, incoming)) in polls.into_iter().zip(receivers).enumerate() {
            let dispatch = DispatchLoop::new(
                index,
                poll,
                incoming,
                Arc::clone(&registry),
                Arc::clone(&context),
                &self.config,
                Arc::clone(&self.shutdown.flag),
                Arc::clone(&self.stats),
            );
            let spawned = dispatch.and_then(|dispatch| {
                thread::Builder::new()
                    .name(format!("dispatch-{}", index))
                    .spawn(move || dispatch.run())
                    .map_err(NodeError::from)
            });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    started = Err(e);
                    break;
                }
            }
        }

        let result = match started {
            Ok(()) => {
                let acceptor = Acceptor::new(Arc::clone(&registry), Arc::clone(&self.stats));
                self.main_loop(&acceptor, loops)
            }
            Err(e) => Err(e),
        };

        self.shutdown.flag.store(true, Ordering::SeqCst);
        registry.wake_all();
        for handle in threads {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Dispatch loop failed: {}", e),
                Err(_) => log::error!("Dispatch loop panicked"),
            }
        }
        log::info!("Server on {} stopped", self.local_addr);
        result
    }

    fn main_loop(&mut self, acceptor: &Acceptor, loops: usize) -> NodeResult<()> {
        let mut events = Events::with_capacity(128);
        let mut round_robin = RoundRobin::new(loops);
        let sweep_interval = (self.config.handshake_ttl() / 2).max(MIN_SWEEP_INTERVAL);
        let mut last_sweep = Instant::now();
        let mut backlog_pending = false;
        let timeout = self.config.select_timeout();

        while !self.shutdown.is_shutdown() {
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if events.iter().any(|event| event.token() == LISTENER) {
                backlog_pending = true;
            }
            // The listener is edge-triggered: a backlog left behind by a
            // failed accept gets no new event, so it is retried every turn
            // until it drains.
            if backlog_pending {
                let listener = &self.listener;
                backlog_pending = !drain_backlog(
                    |index| acceptor.accept(index, listener),
                    &mut round_robin,
                );
            }

            if last_sweep.elapsed() >= sweep_interval {
                self.cache.remove_expired();
                last_sweep = Instant::now();
            }
        }
        Ok(())
    }
}

/// Accept until the listener reports `WouldBlock`
///
/// Transient failures (an aborted or interrupted accept) are skipped. Any
/// other error stops the pass, and `false` is returned so the caller tries
/// again on its next turn.
fn drain_backlog<F>(mut accept_one: F, round_robin: &mut RoundRobin) -> bool
where
    F: FnMut(usize) -> io::Result<Option<SocketAddr>>,
{
    loop {
        match accept_one(round_robin.peek()) {
            Ok(Some(_)) => round_robin.advance(),
            Ok(None) => return true,
            Err(e) if is_transient_accept_error(&e) => {
                log::debug!("Skipping failed accept: {}", e);
            }
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                return false;
            }
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

/// Running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    cache: Arc<ConnectionCache>,
    stats: Arc<EngineStats>,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<NodeResult<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Connections handed to each dispatch loop so far
    pub fn loop_assignments(&self) -> Vec<u64> {
        self.stats.assignments()
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Stop the server and wait for every loop to exit
    pub fn join(mut self) -> NodeResult<()> {
        self.shutdown();
        self.wait()
    }

    fn wait(&mut self) -> NodeResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(NodeError::Io(io::Error::new(ErrorKind::Other, "main loop panicked")))),
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Err(e) = self.wait() {
            log::error!("Server exited with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Initiator;
    use crate::network::client::{PeerChannel, PeerClient};
    use crate::protocol::{Command, Envelope, EnvelopeCodec, NetworkType, VersionMessage};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    const NETWORK: NetworkType = NetworkType::Regtest;

    fn start(loops: usize) -> ServerHandle {
        let config = NodeConfig {
            network: NETWORK,
            listen_host: "127.0.0.1".to_string(),
            port: 0,
            dispatch_loops: loops,
            select_timeout_ms: 50,
            settle_delay_ms: 0,
            ..Default::default()
        };
        Server::bind(config).unwrap().spawn().unwrap()
    }

    fn client(server: &ServerHandle) -> PeerClient {
        PeerClient::connect(
            &server.local_addr().to_string(),
            NETWORK,
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_port_zero_is_discoverable() {
        let server = start(1);
        assert_ne!(server.local_addr().port(), 0);
        server.join().unwrap();
    }

    #[test]
    fn test_handshake_against_running_server() {
        let server = start(2);
        let mut client = client(&server);
        let initiator_cache = Arc::new(ConnectionCache::new());
        let mut initiator = Initiator::new(
            NETWORK,
            VersionMessage::new(Some(server.local_addr()), "/e2e/", 0),
            initiator_cache.clone(),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );

        assert!(initiator.perform(&mut client).unwrap());
        assert!(initiator_cache.is_cached(&client.peer_key()));

        // Connection stays usable after the handshake.
        client.ping(99).unwrap();
        client.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_ping_round_trip_over_several_loops() {
        let server = start(3);
        let mut clients: Vec<_> = (0..6).map(|_| client(&server)).collect();
        for (i, client) in clients.iter_mut().enumerate() {
            client.ping(1000 + i as u64).unwrap();
        }
        let stats = server.stats();
        assert_eq!(stats.accepted, 6);
        assert!(stats.jobs_submitted >= 6);
        server.join().unwrap();
    }

    #[test]
    fn test_connections_spread_round_robin() {
        let server = start(3);
        // One at a time, so accept order matches connect order.
        let clients: Vec<_> = (0..7)
            .map(|i| {
                let mut client = client(&server);
                client.ping(i).unwrap();
                client
            })
            .collect();

        assert_eq!(server.loop_assignments(), vec![3, 2, 2]);
        assert_eq!(server.stats().accepted, 7);
        drop(clients);
        server.join().unwrap();
    }

    #[test]
    fn test_backlog_drained_past_aborted_accept() {
        let script: Vec<io::Result<Option<SocketAddr>>> = vec![
            Err(io::Error::from(ErrorKind::ConnectionAborted)),
            Ok(Some("127.0.0.1:1001".parse().unwrap())),
            Err(io::Error::from(ErrorKind::Interrupted)),
            Ok(Some("127.0.0.1:1002".parse().unwrap())),
            Ok(None),
        ];
        let mut script = script.into_iter();
        let mut seen = Vec::new();
        let mut round_robin = RoundRobin::new(2);

        let drained = drain_backlog(
            |index| {
                seen.push(index);
                script.next().unwrap()
            },
            &mut round_robin,
        );

        assert!(drained);
        assert_eq!(seen, vec![0, 0, 1, 1, 0]);
        assert_eq!(round_robin.peek(), 0);
    }

    #[test]
    fn test_hard_accept_error_leaves_backlog_pending() {
        let script: Vec<io::Result<Option<SocketAddr>>> = vec![
            Ok(Some("127.0.0.1:1001".parse().unwrap())),
            Err(io::Error::new(ErrorKind::Other, "too many open files")),
        ];
        let mut script = script.into_iter();
        let mut round_robin = RoundRobin::new(3);

        assert!(!drain_backlog(|_| script.next().unwrap(), &mut round_robin));
        assert_eq!(round_robin.peek(), 1);
    }

    #[test]
    fn test_shutdown_handle_stops_blocking_run() {
        let config = NodeConfig {
            network: NETWORK,
            listen_host: "127.0.0.1".to_string(),
            port: 0,
            dispatch_loops: 2,
            select_timeout_ms: 50,
            ..Default::default()
        };
        let server = Server::bind(config).unwrap();
        let shutdown = server.shutdown_handle();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let runner = thread::spawn(move || {
            let result = server.run();
            done_tx.send(()).unwrap();
            result
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!shutdown.is_shutdown());
        shutdown.shutdown();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_malformed_input_echoed_not_fatal() {
        let server = start(1);
        let mut raw = TcpStream::connect(server.local_addr()).unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        raw.write_all(&[0x42; 40]).unwrap();

        let reply = EnvelopeCodec::new(NETWORK).parse(&mut raw);
        assert_eq!(reply.kind(), Command::Error);

        // A sibling connection is unaffected.
        let mut sibling = client(&server);
        sibling.ping(5).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_peer_close_is_clean() {
        let server = start(1);
        {
            let mut raw = TcpStream::connect(server.local_addr()).unwrap();
            raw.write_all(&Envelope::verack(NETWORK).to_bytes()).unwrap();
        }
        let mut probe = client(&server);
        probe.ping(1).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.stats().closed < 1 {
            assert!(Instant::now() < deadline, "closed connection never reaped");
            thread::sleep(Duration::from_millis(20));
        }
        server.join().unwrap();
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let server = start(1);
        let mut raw = TcpStream::connect(server.local_addr()).unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut probe = client(&server);
        probe.ping(3).unwrap();

        server.join().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(raw.read(&mut buf).unwrap_or(0), 0);
    }
}
