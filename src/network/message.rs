//! Wire format: a 12-byte zero-padded ASCII command tag followed by the
//! bincode-encoded payload of that command. One message per connection, so the
//! payload simply runs to the end of the stream.

use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use std::fmt;

pub const COMMAND_LENGTH: usize = 12;
pub const NODE_VERSION: u32 = 1;

/// Kind of item referenced by `inv` and `getdata`
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum OpType {
    Tx,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VersionPayload {
    pub version: u32,
    pub best_height: usize,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct InvPayload {
    pub addr_from: String,
    pub op_type: OpType,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub op_type: OpType,
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct AddrPayload {
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    Version(VersionPayload),
    GetBlocks(GetBlocksPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
    Addr(AddrPayload),
}

impl Package {
    pub fn command(&self) -> &'static str {
        match self {
            Package::Version(_) => "version",
            Package::GetBlocks(_) => "getblocks",
            Package::Inv(_) => "inv",
            Package::GetData(_) => "getdata",
            Package::Block(_) => "block",
            Package::Tx(_) => "tx",
            Package::Addr(_) => "addr",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Package::Version(p) => serialize(p)?,
            Package::GetBlocks(p) => serialize(p)?,
            Package::Inv(p) => serialize(p)?,
            Package::GetData(p) => serialize(p)?,
            Package::Block(p) => serialize(p)?,
            Package::Tx(p) => serialize(p)?,
            Package::Addr(p) => serialize(p)?,
        };

        let mut bytes = command_to_bytes(self.command()).to_vec();
        bytes.extend(payload);
        Ok(bytes)
    }

    /// Parses a whole message. Unknown commands and malformed payloads are
    /// protocol errors.
    pub fn from_bytes(bytes: &[u8]) -> Result<Package> {
        if bytes.len() < COMMAND_LENGTH {
            return Err(BlockchainError::Protocol(format!(
                "Message of {} bytes is shorter than the command tag",
                bytes.len()
            )));
        }
        let (tag, payload) = bytes.split_at(COMMAND_LENGTH);
        let command = bytes_to_command(tag)?;

        let package = match command.as_str() {
            "version" => Package::Version(decode_payload(&command, payload)?),
            "getblocks" => Package::GetBlocks(decode_payload(&command, payload)?),
            "inv" => Package::Inv(decode_payload(&command, payload)?),
            "getdata" => Package::GetData(decode_payload(&command, payload)?),
            "block" => Package::Block(decode_payload(&command, payload)?),
            "tx" => Package::Tx(decode_payload(&command, payload)?),
            "addr" => Package::Addr(decode_payload(&command, payload)?),
            _ => {
                return Err(BlockchainError::Protocol(format!(
                    "Unknown command: {command}"
                )))
            }
        };
        Ok(package)
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Package::Version(p) => write!(
                f,
                "version from {} (v{}, height {})",
                p.addr_from, p.version, p.best_height
            ),
            Package::GetBlocks(p) => write!(f, "getblocks from {}", p.addr_from),
            Package::Inv(p) => write!(
                f,
                "inv from {} ({:?}, {} items)",
                p.addr_from,
                p.op_type,
                p.items.len()
            ),
            Package::GetData(p) => write!(f, "getdata from {} ({:?})", p.addr_from, p.op_type),
            Package::Block(p) => write!(f, "block from {}", p.addr_from),
            Package::Tx(p) => write!(f, "tx from {}", p.addr_from),
            Package::Addr(p) => write!(f, "addr ({} peers)", p.addr_list.len()),
        }
    }
}

fn decode_payload<T: bincode::Decode<()>>(command: &str, payload: &[u8]) -> Result<T> {
    deserialize(payload)
        .map_err(|e| BlockchainError::Protocol(format!("Malformed {command} payload: {e}")))
}

pub fn command_to_bytes(command: &str) -> [u8; COMMAND_LENGTH] {
    let mut bytes = [0u8; COMMAND_LENGTH];
    for (slot, byte) in bytes.iter_mut().zip(command.as_bytes()) {
        *slot = *byte;
    }
    bytes
}

pub fn bytes_to_command(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(str::to_string)
        .map_err(|e| BlockchainError::Protocol(format!("Invalid command tag: {e}")))
}
