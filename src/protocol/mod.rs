//! Wire protocol
//!
//! Envelope framing, network constants and the payloads the engine itself
//! needs to understand (`version`, ping nonces). Everything else is carried
//! as opaque payload bytes.

pub mod address;
pub mod codec;
pub mod command;
pub mod envelope;
pub mod network;
pub mod varint;
pub mod version;

pub use address::{peer_key, NetAddr};
pub use codec::{EnvelopeCodec, WireError, MAX_PAYLOAD_SIZE};
pub use command::{Command, COMMAND_LEN};
pub use envelope::{Envelope, EMPTY_PAYLOAD_CHECKSUM, HEADER_LEN, NONCE_LEN};
pub use network::{NetworkType, PROTOCOL_VERSION};
pub use varint::{read_varint, varint_len, write_varint};
pub use version::{default_user_agent, ServiceFlags, VersionMessage};
