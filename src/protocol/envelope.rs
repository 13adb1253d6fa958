//! Framed protocol messages
//!
//! Wire layout (integers little-endian):
//!
//! ```text
//! magic(4) | command(12, zero-padded) | length(4) | checksum(4) | payload(length)
//! ```

use crate::crypto::{checksum, CHECKSUM_LEN};
use crate::protocol::command::{encode_command, Command, COMMAND_LEN};
use crate::protocol::network::NetworkType;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed envelope header
pub const HEADER_LEN: usize = 4 + COMMAND_LEN + 4 + CHECKSUM_LEN;

/// Checksum sent for an empty payload
pub const EMPTY_PAYLOAD_CHECKSUM: [u8; CHECKSUM_LEN] = [0x5D, 0xF6, 0xE0, 0xE2];

/// Length of a ping/pong nonce
pub const NONCE_LEN: usize = 8;

/// One framed protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    magic: [u8; 4],
    command: String,
    payload: Bytes,
}

impl Envelope {
    /// Build an envelope for `network`
    pub fn new(network: NetworkType, command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::with_magic(network.magic(), command, payload)
    }

    /// Build an envelope with explicit magic bytes
    pub fn with_magic(magic: [u8; 4], command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            magic,
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Synthetic envelope describing a framing failure
    pub fn error(magic: [u8; 4], description: &str) -> Self {
        Self::with_magic(
            magic,
            Command::Error.as_str(),
            Bytes::copy_from_slice(description.as_bytes()),
        )
    }

    /// Keep-alive ping carrying `nonce`
    pub fn ping(network: NetworkType, nonce: u64) -> Self {
        Self::new(network, Command::Ping.as_str(), nonce.to_le_bytes().to_vec())
    }

    /// Pong echoing the nonce of a ping
    pub fn pong(network: NetworkType, nonce: u64) -> Self {
        Self::new(network, Command::Pong.as_str(), nonce.to_le_bytes().to_vec())
    }

    /// Empty-payload verack
    pub fn verack(network: NetworkType) -> Self {
        Self::new(network, Command::Verack.as_str(), Bytes::new())
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Raw command token as parsed or built
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Command token mapped onto the known vocabulary
    pub fn kind(&self) -> Command {
        Command::from_wire(&self.command)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Nonce of a ping/pong, if the payload carries one
    pub fn nonce(&self) -> Option<u64> {
        let bytes: [u8; NONCE_LEN] = self.payload.get(..NONCE_LEN)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// Header checksum derived from the payload
    pub fn checksum(&self) -> [u8; CHECKSUM_LEN] {
        if self.payload.is_empty() {
            EMPTY_PAYLOAD_CHECKSUM
        } else {
            checksum(&self.payload)
        }
    }

    /// Total serialized size
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the serialized envelope to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_slice(&self.magic);
        dst.put_slice(&encode_command(&self.command));
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.checksum());
        dst.put_slice(&self.payload);
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::double_sha256;

    #[test]
    fn test_empty_payload_layout() {
        let bytes = Envelope::verack(NetworkType::Main).to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..4], &NetworkType::Main.magic());
        assert_eq!(&bytes[4..10], b"verack");
        assert_eq!(&bytes[16..20], &[0, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &EMPTY_PAYLOAD_CHECKSUM);
    }

    #[test]
    fn test_non_empty_checksum_is_double_hash_prefix() {
        let env = Envelope::ping(NetworkType::Test, 0xDEAD_BEEF);
        let bytes = env.to_bytes();
        let payload = &bytes[HEADER_LEN..];
        assert_eq!(&bytes[16..20], &8u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &double_sha256(payload)[..4]);
    }

    #[test]
    fn test_nonce_accessor() {
        let env = Envelope::pong(NetworkType::Main, 42);
        assert_eq!(env.nonce(), Some(42));
        assert_eq!(Envelope::verack(NetworkType::Main).nonce(), None);
    }

    #[test]
    fn test_error_envelope_carries_description() {
        let env = Envelope::error(NetworkType::Main.magic(), "bad magic");
        assert_eq!(env.kind(), Command::Error);
        assert_eq!(&env.payload()[..], b"bad magic");
    }
}
