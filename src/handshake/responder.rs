//! Responder side of the version handshake
//!
//! An inbound `version` is answered with our own `version` followed by a
//! `verack`, delivered as one transmission so the initiator can read both
//! envelopes from a single chunk.

use crate::handshake::cache::ConnectionCache;
use crate::protocol::{
    peer_key, read_varint, varint_len, write_varint, Envelope, EnvelopeCodec, NetworkType,
    VersionMessage,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Prefix marking the tagged byte form of a handshake bundle
///
/// Starts with a zero byte so it can never be mistaken for a network magic.
pub const BUNDLE_SENTINEL: &[u8; 13] = b"\x00wire-bundle\x00";

/// Serialized `version` + `verack` pair owed to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeBundle {
    version: Bytes,
    verack: Bytes,
}

impl HandshakeBundle {
    pub fn new(version: &Envelope, verack: &Envelope) -> Self {
        Self {
            version: version.to_bytes(),
            verack: verack.to_bytes(),
        }
    }

    /// Both envelopes back to back, as they go on the wire
    pub fn wire_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.version.len() + self.verack.len());
        buf.put_slice(&self.version);
        buf.put_slice(&self.verack);
        buf.freeze()
    }

    /// `sentinel || varint(len) || version || varint(len) || verack`
    pub fn to_tagged_bytes(&self) -> Bytes {
        let capacity = BUNDLE_SENTINEL.len()
            + varint_len(self.version.len() as u64)
            + self.version.len()
            + varint_len(self.verack.len() as u64)
            + self.verack.len();
        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_slice(BUNDLE_SENTINEL);
        write_varint(&mut buf, self.version.len() as u64);
        buf.put_slice(&self.version);
        write_varint(&mut buf, self.verack.len() as u64);
        buf.put_slice(&self.verack);
        buf.freeze()
    }

    /// Recognise the tagged form; `None` for anything else
    pub fn from_tagged_bytes(bytes: &[u8]) -> Option<Self> {
        let mut rest = bytes.strip_prefix(&BUNDLE_SENTINEL[..])?;
        let version = take_prefixed(&mut rest)?;
        let verack = take_prefixed(&mut rest)?;
        if !rest.is_empty() {
            return None;
        }
        Some(Self { version, verack })
    }

    /// Decode the two envelopes
    pub fn envelopes(&self, network: NetworkType) -> Vec<Envelope> {
        EnvelopeCodec::new(network).parse_all(&self.wire_bytes())
    }
}

fn take_prefixed(rest: &mut &[u8]) -> Option<Bytes> {
    let len = read_varint(rest)? as usize;
    if rest.len() < len {
        return None;
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Some(Bytes::copy_from_slice(head))
}

/// Builds handshake replies and records completed handshakes
#[derive(Debug, Clone)]
pub struct Responder {
    network: NetworkType,
    user_agent: String,
    start_height: i32,
    ttl: Duration,
    cache: Arc<ConnectionCache>,
}

impl Responder {
    pub fn new(
        network: NetworkType,
        user_agent: impl Into<String>,
        start_height: i32,
        ttl: Duration,
        cache: Arc<ConnectionCache>,
    ) -> Self {
        Self {
            network,
            user_agent: user_agent.into(),
            start_height,
            ttl,
            cache,
        }
    }

    /// Reply owed to `peer` for its `version` envelope
    pub fn bundle_for(&self, peer: SocketAddr, their_version: &Envelope) -> HandshakeBundle {
        match VersionMessage::decode(their_version.payload()) {
            Some(theirs) => log::debug!(
                "Version from {}: protocol={}, agent={}, height={}",
                peer,
                theirs.version,
                theirs.user_agent,
                theirs.start_height
            ),
            None => log::debug!("Undecodable version payload from {}", peer),
        }

        let ours = VersionMessage::new(Some(peer), &self.user_agent, self.start_height);
        HandshakeBundle::new(
            &ours.to_envelope(self.network),
            &Envelope::verack(self.network),
        )
    }

    /// Mark `peer` as handshaken once the bundle has been sent
    pub fn record(&self, peer: &SocketAddr) {
        self.cache.add_for(peer_key(peer), self.ttl);
        log::info!("Handshake sent to {}", peer);
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }
}
