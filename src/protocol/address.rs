//! Peer addressing helpers

use crate::protocol::version::ServiceFlags;
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Encoded size of a network address inside a `version` payload
pub const NET_ADDR_LEN: usize = 8 + 16 + 2;

/// Network address as carried in a `version` payload
///
/// The IP is always stored as 16 bytes (IPv4 mapped into IPv6) and the
/// port is big-endian, unlike every other integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    pub services: ServiceFlags,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddr {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    /// Placeholder address used when the real one is unknown
    pub fn unspecified() -> Self {
        Self {
            services: ServiceFlags::empty(),
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip = match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.services.bits());
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.port);
    }

    pub fn read_from<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < NET_ADDR_LEN {
            return None;
        }
        let services = ServiceFlags::from_bits_retain(buf.get_u64_le());
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16();
        Some(Self {
            services,
            ip: Ipv6Addr::from(octets),
            port,
        })
    }
}

/// Cache key identifying a peer by `host:port`
pub fn peer_key(addr: &SocketAddr) -> String {
    addr.to_string()
}
