//! Core blockchain functionality
//!
//! Blocks, transactions, the Merkle tree, proof-of-work sealing and the
//! sled-backed ledger.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{
    BlockStatus, Blockchain, BlockchainIterator, ChainParams, DEFAULT_BLOCK_REWARD,
    DEFAULT_GENESIS_DATA,
};
pub use merkle::{MerkleNode, MerkleTree};
pub use proof_of_work::{ProofOfWork, DEFAULT_DIFFICULTY};
pub use transaction::{TXInput, TXOutput, Transaction, COINBASE_OUTPUT_INDEX};
