//! # powchain
//!
//! A minimal proof-of-work blockchain node: a persistent chain of mined
//! blocks, UTXO-model transactions signed with ECDSA P-256, and a small
//! TCP protocol that lets nodes exchange blocks and relay transactions.
//!
//! ## Layout
//! - `core/`: blocks, transactions, Merkle roots, proof of work and the ledger
//! - `storage/`: the UTXO index, memory pool and blocks-in-transit queue
//! - `wallet/`: key pairs, addresses and the wallet file
//! - `network/`: wire format, peer registry and the node server
//! - `config/`: TOML/environment configuration
//! - `utils/`: hashing, base58, signing and bincode helpers
//! - `cli/`: command-line arguments for the `powchain` binary

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{ChainCommand, Command, NodeCommand, Opt, WalletCommand};
pub use config::Config;
pub use core::{
    Block, BlockStatus, Blockchain, BlockchainIterator, ChainParams, MerkleTree, ProofOfWork,
    TXInput, TXOutput, Transaction,
};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, Nodes, OpType, Package, Server, ServerConfig};
pub use storage::{BlockInTransit, MemoryPool, UTXOSet, UnspentOutput};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    convert_address, hash_pub_key, pub_key_hash_from_address, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
