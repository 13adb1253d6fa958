//! Cryptographic utilities for the node
//!
//! Only hashing lives here: signature verification belongs to the layers
//! that consume transactions and blocks, not to the wire engine.

pub mod hash;

pub use hash::{checksum, double_sha256, double_sha256_hex, sha256, CHECKSUM_LEN};
