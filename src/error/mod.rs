//! Error handling for the blockchain
//!
//! Every fallible operation in the crate returns [`Result`]. Consensus and
//! validation failures get their own variants so callers can match on them;
//! storage, network and encoding failures carry the underlying message.

use std::fmt;

/// Result type alias for blockchain operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    /// A transaction failed signature or structural verification
    InvalidTransaction(String),
    /// Spendable outputs do not cover the requested amount
    InsufficientBalance { required: i64, available: i64 },
    /// No local key material for the address
    UnknownWallet(String),
    /// A referenced transaction id is not on the chain
    UnknownTransaction(String),
    /// The nonce search space was exhausted without meeting the target
    ProofNotFound { attempts: u64 },
    /// The nonce search was abandoned because a competing block arrived
    MiningCancelled,
    /// Block validation errors
    InvalidBlock(String),
    /// Invalid address format or checksum
    InvalidAddress(String),
    /// Database-related errors
    Database(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Network communication errors
    Network(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Wallet store errors
    Wallet(String),
    /// Configuration errors
    Config(String),
    /// File I/O errors
    Io(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::InvalidTransaction(msg) => write!(f, "invalid transaction: {msg}"),
            BlockchainError::InsufficientBalance {
                required,
                available,
            } => {
                write!(
                    f,
                    "insufficient balance: required {required}, available {available}"
                )
            }
            BlockchainError::UnknownWallet(addr) => write!(f, "unknown wallet: {addr}"),
            BlockchainError::UnknownTransaction(txid) => {
                write!(f, "transaction not found: {txid}")
            }
            BlockchainError::ProofNotFound { attempts } => {
                write!(f, "proof not found after {attempts} attempts")
            }
            BlockchainError::MiningCancelled => write!(f, "mining cancelled"),
            BlockchainError::InvalidBlock(msg) => write!(f, "invalid block: {msg}"),
            BlockchainError::InvalidAddress(addr) => write!(f, "invalid address: {addr}"),
            BlockchainError::Database(msg) => write!(f, "database error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "serialization error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "network error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "cryptographic error: {msg}"),
            BlockchainError::Wallet(msg) => write!(f, "wallet error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "configuration error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}
