//! `version` message payload

use crate::protocol::address::NetAddr;
use crate::protocol::command::Command;
use crate::protocol::envelope::Envelope;
use crate::protocol::network::{NetworkType, PROTOCOL_VERSION};
use crate::protocol::varint::{read_varint, write_varint};
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use std::net::SocketAddr;

/// Longest user agent accepted from a peer
pub const MAX_USER_AGENT_LEN: usize = 256;

bitflags! {
    /// Services a node advertises
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 1;
        const NODE_GETUTXO = 1 << 1;
        const NODE_BLOOM = 1 << 2;
        const NODE_WITNESS = 1 << 3;
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

/// Decoded `version` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: NetAddr,
    pub sender: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Version message for a peer at `receiver`
    pub fn new(receiver: Option<SocketAddr>, user_agent: &str, start_height: i32) -> Self {
        let services = ServiceFlags::NODE_NETWORK;
        Self {
            version: PROTOCOL_VERSION,
            services,
            timestamp: chrono::Utc::now().timestamp(),
            receiver: receiver
                .map(|addr| NetAddr::new(addr, ServiceFlags::NODE_NETWORK))
                .unwrap_or_else(NetAddr::unspecified),
            sender: NetAddr::unspecified(),
            nonce: rand::random(),
            user_agent: user_agent.to_string(),
            start_height,
            relay: false,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(86 + self.user_agent.len());
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services.bits());
        buf.put_i64_le(self.timestamp);
        self.receiver.write_to(&mut buf);
        self.sender.write_to(&mut buf);
        buf.put_u64_le(self.nonce);
        write_varint(&mut buf, self.user_agent.len() as u64);
        buf.put_slice(self.user_agent.as_bytes());
        buf.put_i32_le(self.start_height);
        buf.put_u8(self.relay as u8);
        buf
    }

    /// Decode a payload; the trailing relay flag is optional
    pub fn decode(mut payload: &[u8]) -> Option<Self> {
        let buf = &mut payload;
        if buf.remaining() < 4 + 8 + 8 {
            return None;
        }
        let version = buf.get_i32_le();
        let services = ServiceFlags::from_bits_retain(buf.get_u64_le());
        let timestamp = buf.get_i64_le();
        let receiver = NetAddr::read_from(buf)?;
        let sender = NetAddr::read_from(buf)?;
        if buf.remaining() < 8 {
            return None;
        }
        let nonce = buf.get_u64_le();

        let agent_len = read_varint(buf)? as usize;
        if agent_len > MAX_USER_AGENT_LEN || buf.remaining() < agent_len {
            return None;
        }
        let user_agent = String::from_utf8_lossy(&buf[..agent_len]).into_owned();
        buf.advance(agent_len);

        if buf.remaining() < 4 {
            return None;
        }
        let start_height = buf.get_i32_le();
        let relay = buf.has_remaining() && buf.get_u8() != 0;

        Some(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }

    pub fn to_envelope(&self, network: NetworkType) -> Envelope {
        Envelope::new(network, Command::Version.as_str(), self.encode().freeze())
    }
}

/// Default user agent string
pub fn default_user_agent() -> String {
    format!("/wire-node:{}/", env!("CARGO_PKG_VERSION"))
}
