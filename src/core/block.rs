use crate::core::{MerkleTree, ProofOfWork, Transaction};
use crate::error::Result;
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    transactions: Vec<Transaction>,
    prev_hash: Vec<u8>,
    hash: Vec<u8>,
    height: u32,
    nonce: u64,
}

impl Block {
    /// Seals a new block on top of `prev_hash` by running the nonce search.
    ///
    /// Fails with `MiningCancelled` when `cancel` is raised mid-search and with
    /// `ProofNotFound` when the search space runs out.
    pub fn seal(
        prev_hash: &[u8],
        transactions: &[Transaction],
        height: u32,
        pow: &ProofOfWork,
        cancel: &AtomicBool,
    ) -> Result<Block> {
        let mut block = Block {
            timestamp: current_timestamp()?,
            transactions: transactions.to_vec(),
            prev_hash: prev_hash.to_vec(),
            hash: vec![],
            height,
            nonce: 0,
        };

        let merkle_root = block.hash_transactions()?;
        info!(
            "Starting proof-of-work for block at height {height} with {} transaction(s)",
            transactions.len()
        );
        let (nonce, hash) = pow.run(prev_hash, &merkle_root, cancel)?;
        block.nonce = nonce;
        block.hash = hash;
        info!(
            "Proof-of-work completed for block {} at height {height}",
            block.get_hash_hex()
        );
        Ok(block)
    }

    /// The first block: empty `prev_hash`, height 0, a single coinbase.
    pub fn generate_genesis_block(
        coinbase: &Transaction,
        pow: &ProofOfWork,
        cancel: &AtomicBool,
    ) -> Result<Block> {
        Block::seal(&[], std::slice::from_ref(coinbase), 0, pow, cancel)
    }

    /// Merkle root over the serialized transactions.
    pub fn hash_transactions(&self) -> Result<Vec<u8>> {
        Ok(MerkleTree::from_transactions(&self.transactions)?.get_root_hash())
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_prev_hash(&self) -> &[u8] {
        self.prev_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_height(&self) -> u32 {
        self.height
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }
}
