//! Command tokens carried in the envelope header

use std::fmt;

/// Width of the zero-padded command field
pub const COMMAND_LEN: usize = 12;

/// Known protocol commands
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    SendHeaders,
    GetHeaders,
    Headers,
    GetData,
    Inv,
    NotFound,
    Tx,
    Block,
    MerkleBlock,
    FilterLoad,
    FilterAdd,
    FilterClear,
    GetAddr,
    Addr,
    Mempool,
    Reject,
    FeeFilter,
    SendCmpct,
    /// Synthetic envelope produced when framing fails
    Error,
    /// Anything else a peer sends
    Unknown(String),
}

impl Command {
    /// Map a trimmed wire token to a command
    pub fn from_wire(token: &str) -> Self {
        match token {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "sendheaders" => Command::SendHeaders,
            "getheaders" => Command::GetHeaders,
            "headers" => Command::Headers,
            "getdata" => Command::GetData,
            "inv" => Command::Inv,
            "notfound" => Command::NotFound,
            "tx" => Command::Tx,
            "block" => Command::Block,
            "merkleblock" => Command::MerkleBlock,
            "filterload" => Command::FilterLoad,
            "filteradd" => Command::FilterAdd,
            "filterclear" => Command::FilterClear,
            "getaddr" => Command::GetAddr,
            "addr" => Command::Addr,
            "mempool" => Command::Mempool,
            "reject" => Command::Reject,
            "feefilter" => Command::FeeFilter,
            "sendcmpct" => Command::SendCmpct,
            "error" => Command::Error,
            other => Command::Unknown(other.to_string()),
        }
    }

    /// Wire token for the command
    pub fn as_str(&self) -> &str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::SendHeaders => "sendheaders",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::GetData => "getdata",
            Command::Inv => "inv",
            Command::NotFound => "notfound",
            Command::Tx => "tx",
            Command::Block => "block",
            Command::MerkleBlock => "merkleblock",
            Command::FilterLoad => "filterload",
            Command::FilterAdd => "filteradd",
            Command::FilterClear => "filterclear",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::Mempool => "mempool",
            Command::Reject => "reject",
            Command::FeeFilter => "feefilter",
            Command::SendCmpct => "sendcmpct",
            Command::Error => "error",
            Command::Unknown(token) => token,
        }
    }

    /// Commands that only make sense once a handshake has completed
    pub fn requires_handshake(&self) -> bool {
        matches!(
            self,
            Command::GetHeaders
                | Command::Headers
                | Command::GetData
                | Command::Inv
                | Command::NotFound
                | Command::Tx
                | Command::Block
                | Command::MerkleBlock
                | Command::FilterLoad
                | Command::FilterAdd
                | Command::FilterClear
                | Command::GetAddr
                | Command::Addr
                | Command::Mempool
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a command token into the fixed 12-byte field (zero-padded, truncated)
pub fn encode_command(token: &str) -> [u8; COMMAND_LEN] {
    let mut field = [0u8; COMMAND_LEN];
    let bytes = token.as_bytes();
    let len = bytes.len().min(COMMAND_LEN);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Decode the fixed 12-byte field, right-trimming zero padding
pub fn decode_command(field: &[u8; COMMAND_LEN]) -> Option<String> {
    let end = field
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let token = &field[..end];
    if token.iter().all(|b| b.is_ascii_graphic()) {
        Some(String::from_utf8_lossy(token).into_owned())
    } else {
        None
    }
}
