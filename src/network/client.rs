//! Outbound peer connections
//!
//! [`PeerChannel`] is the small send/read/close contract shared by real
//! outbound clients and scripted test peers. [`PeerClient`] implements it
//! over a blocking socket with timeouts; outbound clients are short-lived
//! and live outside the event-loop engine.

use crate::network::error::NodeError;
use crate::protocol::{peer_key, Command, Envelope, EnvelopeCodec, NetworkType};
use bytes::BytesMut;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio_util::codec::Decoder;

/// Bytes requested per read from a peer
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of envelopes [`PeerClient::exchange`] inspects
pub const DEFAULT_EXCHANGE_ATTEMPTS: usize = 8;

/// Primitive per-connection contract
pub trait PeerChannel {
    /// Write one envelope
    fn send(&mut self, envelope: &Envelope) -> Result<(), NodeError>;

    /// Read the next chunk of raw bytes as delivered by the transport
    fn read_chunk(&mut self) -> Result<Vec<u8>, NodeError>;

    /// Key identifying the remote peer in the connection cache
    fn peer_key(&self) -> String;

    /// Release the underlying transport
    fn close(&mut self) -> Result<(), NodeError>;
}

/// Blocking outbound connection
pub struct PeerClient {
    stream: TcpStream,
    peer: SocketAddr,
    codec: EnvelopeCodec,
    buffer: BytesMut,
}

impl PeerClient {
    /// Connect with a connect timeout and apply a read timeout
    pub fn connect(
        addr: &str,
        network: NetworkType,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, NodeError> {
        let peer = addr.to_socket_addrs()?.next().ok_or_else(|| {
            NodeError::Io(std::io::Error::new(
                ErrorKind::AddrNotAvailable,
                format!("could not resolve {}", addr),
            ))
        })?;
        let stream = TcpStream::connect_timeout(&peer, connect_timeout)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        log::debug!("Connected to {}", peer);
        Ok(Self::from_stream(stream, peer, network))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, peer: SocketAddr, network: NetworkType) -> Self {
        Self {
            stream,
            peer,
            codec: EnvelopeCodec::new(network),
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn network(&self) -> NetworkType {
        self.codec.network()
    }

    /// Read exactly one envelope, buffering across partial reads
    pub fn read_envelope(&mut self) -> Result<Envelope, NodeError> {
        loop {
            if let Some(envelope) = self.codec.decode(&mut self.buffer)? {
                return Ok(envelope);
            }
            let chunk = self.read_chunk()?;
            self.buffer.extend_from_slice(&chunk);
        }
    }

    /// Send `request` and wait for an envelope with the `expected` command
    ///
    /// Pings arriving in the meantime are answered. Every other envelope
    /// counts against `max_attempts`; the call fails once they run out.
    pub fn exchange(
        &mut self,
        request: &Envelope,
        expected: Command,
        max_attempts: usize,
    ) -> Result<Envelope, NodeError> {
        self.send(request)?;
        let mut attempts = 0;
        while attempts < max_attempts {
            let envelope = self.read_envelope()?;
            match envelope.kind() {
                kind if kind == expected => return Ok(envelope),
                Command::Ping => {
                    let nonce = envelope.nonce().unwrap_or_default();
                    self.send(&Envelope::pong(self.network(), nonce))?;
                }
                other => {
                    attempts += 1;
                    log::debug!(
                        "Waiting for {} from {}, got {} ({}/{})",
                        expected,
                        self.peer,
                        other,
                        attempts,
                        max_attempts
                    );
                }
            }
        }
        Err(NodeError::Timeout(expected.to_string()))
    }

    /// Ping the peer and wait for the pong carrying the same nonce
    pub fn ping(&mut self, nonce: u64) -> Result<(), NodeError> {
        let request = Envelope::ping(self.network(), nonce);
        let mut attempts = 0;
        let mut reply = self.exchange(&request, Command::Pong, DEFAULT_EXCHANGE_ATTEMPTS)?;
        while reply.nonce() != Some(nonce) {
            attempts += 1;
            if attempts >= DEFAULT_EXCHANGE_ATTEMPTS {
                return Err(NodeError::Timeout(format!("pong {}", nonce)));
            }
            reply = self.read_envelope()?;
        }
        Ok(())
    }
}

impl PeerChannel for PeerClient {
    fn send(&mut self, envelope: &Envelope) -> Result<(), NodeError> {
        self.stream.write_all(&envelope.to_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_chunk(&mut self) -> Result<Vec<u8>, NodeError> {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let read = loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(NodeError::Disconnected),
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(NodeError::Timeout(format!("data from {}", self.peer)))
                }
                Err(e) => return Err(e.into()),
            }
        };
        chunk.truncate(read);
        Ok(chunk)
    }

    fn peer_key(&self) -> String {
        peer_key(&self.peer)
    }

    fn close(&mut self) -> Result<(), NodeError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (PeerClient, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = PeerClient::connect(
            &addr.to_string(),
            NetworkType::Regtest,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_read_envelope_across_partial_writes() {
        let (mut client, mut server) = pair();
        let bytes = Envelope::ping(NetworkType::Regtest, 77).to_bytes();
        let writer = thread::spawn(move || {
            server.write_all(&bytes[..7]).unwrap();
            thread::sleep(Duration::from_millis(50));
            server.write_all(&bytes[7..]).unwrap();
            server
        });
        let envelope = client.read_envelope().unwrap();
        assert_eq!(envelope.nonce(), Some(77));
        writer.join().unwrap();
    }

    #[test]
    fn test_exchange_answers_pings_and_skips_noise() {
        let (mut client, mut server) = pair();
        let peer = thread::spawn(move || {
            let mut codec = EnvelopeCodec::new(NetworkType::Regtest);
            let request = codec.parse(&mut server);
            assert_eq!(request.command(), "getheaders");

            server
                .write_all(&Envelope::ping(NetworkType::Regtest, 5).to_bytes())
                .unwrap();
            let pong = codec.parse(&mut server);
            assert_eq!(pong.nonce(), Some(5));

            server
                .write_all(&Envelope::new(NetworkType::Regtest, "inv", vec![0u8]).to_bytes())
                .unwrap();
            server
                .write_all(&Envelope::new(NetworkType::Regtest, "headers", vec![0u8]).to_bytes())
                .unwrap();
            server
        });

        let request = Envelope::new(NetworkType::Regtest, "getheaders", vec![1u8]);
        let reply = client.exchange(&request, Command::Headers, 3).unwrap();
        assert_eq!(reply.kind(), Command::Headers);
        peer.join().unwrap();
    }

    #[test]
    fn test_exchange_gives_up_after_attempts() {
        let (mut client, mut server) = pair();
        let peer = thread::spawn(move || {
            let mut codec = EnvelopeCodec::new(NetworkType::Regtest);
            let _ = codec.parse(&mut server);
            for _ in 0..2 {
                server
                    .write_all(&Envelope::verack(NetworkType::Regtest).to_bytes())
                    .unwrap();
            }
            server
        });

        let request = Envelope::new(NetworkType::Regtest, "getdata", vec![1u8]);
        let result = client.exchange(&request, Command::Tx, 2);
        assert!(matches!(result, Err(NodeError::Timeout(_))));
        peer.join().unwrap();
    }

    #[test]
    fn test_peer_close_reported() {
        let (mut client, server) = pair();
        drop(server);
        assert!(matches!(client.read_chunk(), Err(NodeError::Disconnected)));
        client.close().unwrap();
    }
}
