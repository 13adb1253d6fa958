//! Initiator side of the version handshake
//!
//! ```text
//! Start --send version--> VersionSent --> AwaitingBundle
//!   AwaitingBundle --chunk is [version, verack]--> send verack, settle --> Complete
//!   AwaitingBundle --any other chunk------------------------------------> Failed
//! ```
//!
//! Transport errors abort the handshake and are returned to the caller. A
//! malformed or mis-ordered reply is only a logical failure: `perform`
//! returns `Ok(false)` and the connection stays open.

use crate::handshake::cache::ConnectionCache;
use crate::network::client::PeerChannel;
use crate::network::error::{NodeError, NodeResult};
use crate::protocol::{Command, Envelope, EnvelopeCodec, NetworkType, VersionMessage};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    VersionSent,
    AwaitingBundle,
    Complete,
    Failed,
}

/// Drives the outbound handshake over a [`PeerChannel`]
pub struct Initiator {
    network: NetworkType,
    version: VersionMessage,
    cache: Arc<ConnectionCache>,
    ttl: Duration,
    settle_delay: Duration,
    state: HandshakeState,
    peer_version: Option<VersionMessage>,
}

impl Initiator {
    pub fn new(
        network: NetworkType,
        version: VersionMessage,
        cache: Arc<ConnectionCache>,
        ttl: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            network,
            version,
            cache,
            ttl,
            settle_delay,
            state: HandshakeState::Start,
            peer_version: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The responder's decoded `version`, once received
    pub fn peer_version(&self) -> Option<&VersionMessage> {
        self.peer_version.as_ref()
    }

    /// Run the handshake; `Ok(true)` once the peer is ready for use
    pub fn perform<C: PeerChannel>(&mut self, channel: &mut C) -> Result<bool, NodeError> {
        loop {
            match self.state {
                HandshakeState::Start => {
                    channel.send(&self.version.to_envelope(self.network))?;
                    self.state = HandshakeState::VersionSent;
                }
                HandshakeState::VersionSent => {
                    self.state = HandshakeState::AwaitingBundle;
                }
                HandshakeState::AwaitingBundle => {
                    let chunk = channel.read_chunk()?;
                    let envelopes = EnvelopeCodec::new(self.network).parse_all(&chunk);
                    if !self.accept_bundle(&envelopes) {
                        log::warn!(
                            "Handshake with {} failed: unexpected reply {:?}",
                            channel.peer_key(),
                            envelopes.iter().map(|e| e.command()).collect::<Vec<_>>()
                        );
                        self.state = HandshakeState::Failed;
                        return Ok(false);
                    }

                    channel.send(&Envelope::verack(self.network))?;
                    if !self.settle_delay.is_zero() {
                        thread::sleep(self.settle_delay);
                    }
                    let key = channel.peer_key();
                    self.cache.add_for(key.clone(), self.ttl);
                    self.state = HandshakeState::Complete;
                    log::info!("Handshake with {} complete", key);
                }
                HandshakeState::Complete => return Ok(true),
                HandshakeState::Failed => return Ok(false),
            }
        }
    }

    /// Like [`Initiator::perform`], but a logical failure becomes
    /// [`NodeError::HandshakeFailed`]
    pub fn complete<C: PeerChannel>(&mut self, channel: &mut C) -> NodeResult<()> {
        if self.perform(channel)? {
            Ok(())
        } else {
            Err(NodeError::HandshakeFailed(channel.peer_key()))
        }
    }

    fn accept_bundle(&mut self, envelopes: &[Envelope]) -> bool {
        match envelopes {
            [version, verack]
                if version.kind() == Command::Version && verack.kind() == Command::Verack =>
            {
                self.peer_version = VersionMessage::decode(version.payload());
                if let Some(theirs) = &self.peer_version {
                    log::debug!(
                        "Peer agent={} height={}",
                        theirs.user_agent,
                        theirs.start_height
                    );
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::responder::HandshakeBundle;
    use std::collections::VecDeque;
    use std::time::Instant;

    const PEER: &str = "127.0.0.1:18444";

    /// Scripted peer: replays canned chunks and records what was sent
    struct ScriptedPeer {
        replies: VecDeque<Vec<u8>>,
        sent: Vec<Envelope>,
        closed: bool,
    }

    impl ScriptedPeer {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: replies.into(),
                sent: Vec::new(),
                closed: false,
            }
        }
    }

    impl PeerChannel for ScriptedPeer {
        fn send(&mut self, envelope: &Envelope) -> Result<(), NodeError> {
            self.sent.push(envelope.clone());
            Ok(())
        }

        fn read_chunk(&mut self) -> Result<Vec<u8>, NodeError> {
            self.replies.pop_front().ok_or(NodeError::Disconnected)
        }

        fn peer_key(&self) -> String {
            PEER.to_string()
        }

        fn close(&mut self) -> Result<(), NodeError> {
            self.closed = true;
            Ok(())
        }
    }

    fn initiator(cache: Arc<ConnectionCache>) -> Initiator {
        Initiator::new(
            NetworkType::Regtest,
            VersionMessage::new(None, "/initiator:test/", 0),
            cache,
            Duration::from_secs(60),
            Duration::ZERO,
        )
    }

    fn version() -> Envelope {
        VersionMessage::new(None, "/responder:test/", 42).to_envelope(NetworkType::Regtest)
    }

    #[test]
    fn test_bundle_completes_handshake() {
        let cache = Arc::new(ConnectionCache::new());
        let bundle = HandshakeBundle::new(&version(), &Envelope::verack(NetworkType::Regtest));
        let mut peer = ScriptedPeer::new(vec![bundle.wire_bytes().to_vec()]);
        let mut init = initiator(cache.clone());

        let before = Instant::now();
        assert!(init.perform(&mut peer).unwrap());
        assert_eq!(init.state(), HandshakeState::Complete);
        assert_eq!(init.peer_version().unwrap().start_height, 42);

        let sent: Vec<_> = peer.sent.iter().map(|e| e.command()).collect();
        assert_eq!(sent, vec!["version", "verack"]);
        assert!(!peer.closed);

        assert!(cache.is_cached(PEER));
        let expiry = cache.expiry_of(PEER).unwrap();
        assert!(expiry >= before + Duration::from_secs(60));
        assert!(expiry <= Instant::now() + Duration::from_secs(60));
    }

    #[test]
    fn test_single_envelope_reply_fails() {
        let cache = Arc::new(ConnectionCache::new());
        let mut peer = ScriptedPeer::new(vec![version().to_bytes().to_vec()]);
        let mut init = initiator(cache.clone());

        assert!(!init.perform(&mut peer).unwrap());
        assert_eq!(init.state(), HandshakeState::Failed);
        assert!(!peer.closed);
        assert_eq!(peer.sent.len(), 1);
        assert!(!cache.is_cached(PEER));
    }

    #[test]
    fn test_misordered_reply_fails() {
        let cache = Arc::new(ConnectionCache::new());
        let mut chunk = Envelope::verack(NetworkType::Regtest).to_bytes().to_vec();
        chunk.extend_from_slice(&version().to_bytes());
        let mut peer = ScriptedPeer::new(vec![chunk]);
        let mut init = initiator(cache.clone());

        assert!(!init.perform(&mut peer).unwrap());
        assert!(!peer.closed);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_complete_reports_failed_handshake() {
        let mut peer = ScriptedPeer::new(vec![version().to_bytes().to_vec()]);
        let mut init = initiator(Arc::new(ConnectionCache::new()));
        assert!(matches!(
            init.complete(&mut peer),
            Err(NodeError::HandshakeFailed(key)) if key == PEER
        ));

        let bundle = HandshakeBundle::new(&version(), &Envelope::verack(NetworkType::Regtest));
        let mut peer = ScriptedPeer::new(vec![bundle.wire_bytes().to_vec()]);
        let mut init = initiator(Arc::new(ConnectionCache::new()));
        assert!(init.complete(&mut peer).is_ok());
    }

    #[test]
    fn test_garbage_reply_fails() {
        let mut peer = ScriptedPeer::new(vec![b"definitely not an envelope".to_vec()]);
        let mut init = initiator(Arc::new(ConnectionCache::new()));
        assert!(!init.perform(&mut peer).unwrap());
    }

    #[test]
    fn test_transport_error_propagates() {
        let mut peer = ScriptedPeer::new(vec![]);
        let mut init = initiator(Arc::new(ConnectionCache::new()));
        assert!(matches!(init.perform(&mut peer), Err(NodeError::Disconnected)));
        assert_eq!(init.state(), HandshakeState::AwaitingBundle);
    }
}
