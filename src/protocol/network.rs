//! Network variants and their wire constants

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol version advertised in `version` messages
pub const PROTOCOL_VERSION: i32 = 70015;

/// Which network a peer speaks, selected by the 4-byte magic prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network
    #[default]
    Main,
    /// Public test network
    Test,
    /// Local regression-test network
    Regtest,
}

impl NetworkType {
    /// Magic bytes in wire order
    pub fn magic(&self) -> [u8; 4] {
        match self {
            NetworkType::Main => [0xF9, 0xBE, 0xB4, 0xD9],
            NetworkType::Test => [0x0B, 0x11, 0x09, 0x07],
            NetworkType::Regtest => [0xFA, 0xBF, 0xB5, 0xDA],
        }
    }

    /// Default listening port for the network
    pub fn default_port(&self) -> u16 {
        match self {
            NetworkType::Main => 8333,
            NetworkType::Test => 18333,
            NetworkType::Regtest => 18444,
        }
    }

    /// Resolve a network from its magic bytes
    pub fn from_magic(magic: [u8; 4]) -> Option<Self> {
        [NetworkType::Main, NetworkType::Test, NetworkType::Regtest]
            .into_iter()
            .find(|n| n.magic() == magic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Main => "main",
            NetworkType::Test => "test",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(NetworkType::Main),
            "test" | "testnet" => Ok(NetworkType::Test),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}
