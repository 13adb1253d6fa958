//! Hashing utilities for the wire protocol
//!
//! Envelope integrity relies on SHA-256d (SHA-256 of SHA-256), truncated to
//! its first four bytes for the header checksum.

use sha2::{Digest, Sha256};

/// Length of the truncated checksum carried in every envelope header
pub const CHECKSUM_LEN: usize = 4;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// First four bytes of the double SHA-256 of `payload`
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = double_sha256(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}
