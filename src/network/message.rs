//! Wire format
//!
//! Every message is a 12-byte, zero-padded ASCII command followed by the
//! bincode encoding of that command's payload. One message travels per TCP
//! connection, so the payload runs to end-of-stream.

use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use serde::{Deserialize, Serialize};

pub const COMMAND_LENGTH: usize = 12;
pub const NODE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum OpType {
    Tx,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct VersionPayload {
    pub addr_from: String,
    pub version: u32,
    pub best_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct InvPayload {
    pub addr_from: String,
    pub op_type: OpType,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub op_type: OpType,
    pub id: Vec<u8>,
}

/// `block` is a serialized [`crate::core::Block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

/// `transaction` is a serialized [`crate::core::Transaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    Version(VersionPayload),
    GetBlocks(GetBlocksPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Package {
    pub fn command(&self) -> &'static str {
        match self {
            Package::Version(_) => "version",
            Package::GetBlocks(_) => "getblocks",
            Package::Inv(_) => "inventory",
            Package::GetData(_) => "getdata",
            Package::Block(_) => "block",
            Package::Tx(_) => "transaction",
        }
    }

    pub fn addr_from(&self) -> &str {
        match self {
            Package::Version(p) => &p.addr_from,
            Package::GetBlocks(p) => &p.addr_from,
            Package::Inv(p) => &p.addr_from,
            Package::GetData(p) => &p.addr_from,
            Package::Block(p) => &p.addr_from,
            Package::Tx(p) => &p.addr_from,
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
        };
        let mut bytes = command_to_bytes(self.command()).to_vec();
        bytes.extend(payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Package> {
        if bytes.len() < COMMAND_LENGTH {
            return Err(BlockchainError::Network(format!(
                "message of {} bytes is shorter than its command",
                bytes.len()
            )));
        }
        let (command, payload) = bytes.split_at(COMMAND_LENGTH);
        let command = bytes_to_command(command);

        let package = match command.as_str() {
            "version" => Package::Version(deserialize(payload)?),
            "getblocks" => Package::GetBlocks(deserialize(payload)?),
            "inventory" => Package::Inv(deserialize(payload)?),
            "getdata" => Package::GetData(deserialize(payload)?),
            "block" => Package::Block(deserialize(payload)?),
            "transaction" => Package::Tx(deserialize(payload)?),
            other => {
                return Err(BlockchainError::Network(format!(
                    "unknown command {other:?}"
                )))
            }
        };
        Ok(package)
    }
}

fn command_to_bytes(command: &str) -> [u8; COMMAND_LENGTH] {
    let mut bytes = [0u8; COMMAND_LENGTH];
    for (slot, b) in bytes.iter_mut().zip(command.bytes()) {
        *slot = b;
    }
    bytes
}

fn bytes_to_command(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_framing() {
        let pkg = Package::GetBlocks(GetBlocksPayload {
            addr_from: "localhost:3001".to_string(),
        });
        let bytes = pkg.to_bytes().unwrap();

        assert_eq!(&bytes[..9], b"getblocks");
        assert!(bytes[9..COMMAND_LENGTH].iter().all(|b| *b == 0));
        assert_eq!(Package::from_bytes(&bytes).unwrap(), pkg);
    }

    #[test]
    fn test_longest_command_fills_tag() {
        let pkg = Package::Tx(TxPayload {
            addr_from: "localhost:3001".to_string(),
            transaction: vec![1, 2, 3],
        });
        let bytes = pkg.to_bytes().unwrap();
        assert_eq!(&bytes[..11], b"transaction");
        assert_eq!(Package::from_bytes(&bytes).unwrap(), pkg);
    }

    #[test]
    fn test_inventory_decodes() {
        let pkg = Package::Inv(InvPayload {
            addr_from: "127.0.0.1:3000".to_string(),
            op_type: OpType::Block,
            items: vec![vec![1; 32], vec![2; 32]],
        });
        let decoded = Package::from_bytes(&pkg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.command(), "inventory");
        assert_eq!(decoded.addr_from(), "127.0.0.1:3000");
        assert_eq!(decoded, pkg);
    }

    #[test]
    fn test_rejects_short_and_unknown_messages() {
        assert!(matches!(
            Package::from_bytes(b"version"),
            Err(BlockchainError::Network(_))
        ));

        let mut bytes = command_to_bytes("gossip").to_vec();
        bytes.extend([0u8; 4]);
        assert!(matches!(
            Package::from_bytes(&bytes),
            Err(BlockchainError::Network(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let pkg = Package::Version(VersionPayload {
            addr_from: "localhost:3000".to_string(),
            version: NODE_VERSION,
            best_height: 7,
        });
        let bytes = pkg.to_bytes().unwrap();
        assert!(Package::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }
}
