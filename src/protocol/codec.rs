//! Envelope codec
//!
//! Two entry points share the same header validation:
//! - [`EnvelopeCodec::parse`] pulls one envelope from a blocking [`Read`] and
//!   never fails: framing problems come back as a synthetic `error` envelope.
//! - The [`Decoder`]/[`Encoder`] impls frame a growing [`BytesMut`] and
//!   tolerate partial reads by returning `Ok(None)` until a frame is complete.
//!
//! A codec instance belongs to one reader. Sharing one between connections
//! interleaves their framing.

use crate::crypto::{checksum, CHECKSUM_LEN};
use crate::protocol::command::{decode_command, COMMAND_LEN};
use crate::protocol::envelope::{Envelope, EMPTY_PAYLOAD_CHECKSUM, HEADER_LEN};
use crate::protocol::network::NetworkType;
use bytes::{Bytes, BytesMut};
use std::io::{self, Cursor, Read};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload accepted from a peer (32 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Envelope framing errors
#[derive(Error, Debug)]
pub enum WireError {
    #[error("connection reset")]
    ConnectionReset,
    #[error("bad magic: expected {expected}, found {found}")]
    BadMagic { expected: String, found: String },
    #[error("truncated {0} field")]
    Truncated(&'static str),
    #[error("payload of {length} bytes exceeds limit of {max}")]
    PayloadTooLarge { length: usize, max: usize },
    #[error("checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch { expected: String, found: String },
    #[error("command field is not ASCII")]
    InvalidCommand,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Validated header fields
#[derive(Debug, Clone)]
struct Header {
    magic: [u8; 4],
    command: String,
    length: usize,
    checksum: [u8; CHECKSUM_LEN],
}

/// Stateful envelope reader/writer for a single connection
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    network: NetworkType,
    max_payload: usize,
    /// Header already validated while waiting for the rest of its payload
    pending: Option<Header>,
}

impl EnvelopeCodec {
    pub fn new(network: NetworkType) -> Self {
        Self::with_max_payload(network, MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(network: NetworkType, max_payload: usize) -> Self {
        Self {
            network,
            max_payload,
            pending: None,
        }
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    /// Read one envelope; failures become an `error` envelope
    pub fn parse<R: Read>(&mut self, reader: &mut R) -> Envelope {
        match self.try_parse(reader) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!("Envelope parse failed: {}", e);
                Envelope::error(self.network.magic(), &e.to_string())
            }
        }
    }

    /// Read one envelope, surfacing the framing error
    pub fn try_parse<R: Read>(&mut self, reader: &mut R) -> Result<Envelope, WireError> {
        let mut raw = [0u8; HEADER_LEN];
        let read = read_fully(reader, &mut raw)?;
        if read == 0 {
            return Err(WireError::ConnectionReset);
        }
        if read < HEADER_LEN {
            return Err(WireError::Truncated(truncated_field(read)));
        }

        let header = self.parse_header(&raw)?;
        let payload = if header.length > 0 {
            let mut payload = vec![0u8; header.length];
            if read_fully(reader, &mut payload)? < header.length {
                return Err(WireError::Truncated("payload"));
            }
            Bytes::from(payload)
        } else {
            Bytes::new()
        };

        finish(header, payload)
    }

    /// Parse every envelope in `chunk`
    ///
    /// A failure anywhere in the chunk discards the envelopes already parsed
    /// and yields an empty sequence.
    pub fn parse_all(&mut self, chunk: &[u8]) -> Vec<Envelope> {
        let mut cursor = Cursor::new(chunk);
        let mut envelopes = Vec::new();

        while (cursor.position() as usize) < chunk.len() {
            match self.try_parse(&mut cursor) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    log::debug!(
                        "Discarding {}-byte chunk after {} envelopes: {}",
                        chunk.len(),
                        envelopes.len(),
                        e
                    );
                    return Vec::new();
                }
            }
        }

        envelopes
    }

    fn parse_header(&self, raw: &[u8; HEADER_LEN]) -> Result<Header, WireError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&raw[..4]);
        if magic != self.network.magic() {
            return Err(WireError::BadMagic {
                expected: hex::encode(self.network.magic()),
                found: hex::encode(magic),
            });
        }

        let mut field = [0u8; COMMAND_LEN];
        field.copy_from_slice(&raw[4..4 + COMMAND_LEN]);
        let command = decode_command(&field).ok_or(WireError::InvalidCommand)?;

        let offset = 4 + COMMAND_LEN;
        let length = u32::from_le_bytes([
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        ]) as usize;
        if length > self.max_payload {
            return Err(WireError::PayloadTooLarge {
                length,
                max: self.max_payload,
            });
        }

        let mut sum = [0u8; CHECKSUM_LEN];
        sum.copy_from_slice(&raw[offset + 4..HEADER_LEN]);

        Ok(Header {
            magic,
            command,
            length,
            checksum: sum,
        })
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(&src[..HEADER_LEN]);
                let header = self.parse_header(&raw)?;
                let _ = src.split_to(HEADER_LEN);
                header
            }
        };

        if src.len() < header.length {
            src.reserve(header.length - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(header.length).freeze();
        finish(header, payload).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = WireError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

impl Encoder<&Envelope> for EnvelopeCodec {
    type Error = WireError;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

/// Check the payload against the header checksum and build the envelope
fn finish(header: Header, payload: Bytes) -> Result<Envelope, WireError> {
    let expected = if payload.is_empty() {
        EMPTY_PAYLOAD_CHECKSUM
    } else {
        checksum(&payload)
    };
    if header.checksum != expected {
        return Err(WireError::ChecksumMismatch {
            expected: hex::encode(expected),
            found: hex::encode(header.checksum),
        });
    }
    Ok(Envelope::with_magic(header.magic, header.command, payload))
}

/// Fill `buf` from `reader`, stopping early only at end of stream
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn truncated_field(read: usize) -> &'static str {
    match read {
        0..=3 => "magic",
        4..=15 => "command",
        16..=19 => "length",
        _ => "checksum",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::Command;

    fn parse_bytes(bytes: &[u8]) -> Envelope {
        EnvelopeCodec::new(NetworkType::Main).parse(&mut Cursor::new(bytes))
    }

    #[test]
    fn test_round_trip() {
        let cases = [
            Envelope::verack(NetworkType::Main),
            Envelope::ping(NetworkType::Main, 7),
            Envelope::new(NetworkType::Main, "sendheaders", Bytes::new()),
            Envelope::new(NetworkType::Main, "headers", vec![0xAB; 4096]),
            Envelope::new(NetworkType::Main, "twelvebytes!", vec![1, 2, 3]),
        ];
        for envelope in cases {
            assert_eq!(parse_bytes(&envelope.to_bytes()), envelope);
        }
    }

    #[test]
    fn test_bad_magic_becomes_error_envelope() {
        let bytes = Envelope::ping(NetworkType::Test, 1).to_bytes();
        let parsed = parse_bytes(&bytes);
        assert_eq!(parsed.kind(), Command::Error);
        let description = String::from_utf8_lossy(parsed.payload());
        assert!(description.contains("bad magic"), "{}", description);
    }

    #[test]
    fn test_empty_stream_is_connection_reset() {
        let parsed = parse_bytes(&[]);
        assert_eq!(parsed.kind(), Command::Error);
        assert_eq!(&parsed.payload()[..], b"connection reset");
    }

    #[test]
    fn test_truncated_header() {
        let bytes = Envelope::ping(NetworkType::Main, 1).to_bytes();
        let mut codec = EnvelopeCodec::new(NetworkType::Main);
        let err = codec.try_parse(&mut Cursor::new(&bytes[..10])).unwrap_err();
        assert!(matches!(err, WireError::Truncated("command")));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = Envelope::ping(NetworkType::Main, 1).to_bytes();
        let mut codec = EnvelopeCodec::new(NetworkType::Main);
        let err = codec
            .try_parse(&mut Cursor::new(&bytes[..bytes.len() - 3]))
            .unwrap_err();
        assert!(matches!(err, WireError::Truncated("payload")));
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut bytes = Envelope::ping(NetworkType::Main, 99).to_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut codec = EnvelopeCodec::new(NetworkType::Main);
        let err = codec.try_parse(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, WireError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_empty_payload_requires_fixed_checksum() {
        let mut bytes = Envelope::verack(NetworkType::Main).to_bytes().to_vec();
        bytes[20..24].copy_from_slice(&[0, 0, 0, 0]);
        let parsed = parse_bytes(&bytes);
        assert_eq!(parsed.kind(), Command::Error);
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut bytes = Envelope::ping(NetworkType::Main, 1).to_bytes().to_vec();
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        let mut codec = EnvelopeCodec::with_max_payload(NetworkType::Main, 1024);
        let err = codec.try_parse(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_parse_all_in_order() {
        let mut chunk = Envelope::new(NetworkType::Main, "version", vec![1, 2, 3]).to_bytes().to_vec();
        chunk.extend_from_slice(&Envelope::verack(NetworkType::Main).to_bytes());
        let envelopes = EnvelopeCodec::new(NetworkType::Main).parse_all(&chunk);
        let commands: Vec<_> = envelopes.iter().map(|e| e.command()).collect();
        assert_eq!(commands, vec!["version", "verack"]);
    }

    #[test]
    fn test_parse_all_discards_chunk_on_failure() {
        let mut chunk = Envelope::verack(NetworkType::Main).to_bytes().to_vec();
        chunk.extend_from_slice(&[0xF9, 0xBE]);
        assert!(EnvelopeCodec::new(NetworkType::Main).parse_all(&chunk).is_empty());
    }

    #[test]
    fn test_decoder_handles_partial_frames() {
        let envelope = Envelope::ping(NetworkType::Regtest, 0x0102_0304);
        let bytes = envelope.to_bytes();
        let mut codec = EnvelopeCodec::new(NetworkType::Regtest);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&bytes[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[5..HEADER_LEN + 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[HEADER_LEN + 2..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(envelope));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoder_matches_serialize() {
        let envelope = Envelope::pong(NetworkType::Main, 5);
        let mut codec = EnvelopeCodec::new(NetworkType::Main);
        let mut buf = BytesMut::new();
        codec.encode(&envelope, &mut buf).unwrap();
        assert_eq!(buf.freeze(), envelope.to_bytes());
    }
}
