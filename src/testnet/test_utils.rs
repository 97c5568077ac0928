//! Test utilities for blockchain testing

use crate::core::{Block, Blockchain, ChainParams};
use crate::error::Result;
use crate::wallet::{Wallets, WALLET_FILE};
use tempfile::{tempdir, TempDir};

pub const TEST_PASSPHRASE: &str = "correct horse battery";

/// Chain parameters with an easy target so tests mine instantly.
pub fn test_params() -> ChainParams {
    ChainParams {
        difficulty: 1,
        ..ChainParams::default()
    }
}

/// A fresh chain in a temporary directory whose genesis reward pays the
/// returned address. The `TempDir` must outlive the chain.
pub fn create_test_blockchain() -> (TempDir, Blockchain, Wallets, String) {
    let dir = tempdir().unwrap();
    let mut wallets = Wallets::load(dir.path().join(WALLET_FILE), TEST_PASSPHRASE).unwrap();
    let address = wallets.create_wallet().unwrap();
    let chain = Blockchain::init_chain(dir.path().join("db"), &address, test_params()).unwrap();
    (dir, chain, wallets, address)
}

/// Walks tip to genesis checking proof of work, parent links and heights.
pub fn validate_blockchain_integrity(blockchain: &Blockchain) -> Result<bool> {
    let mut child: Option<Block> = None;

    for block in blockchain.iterator() {
        let block = block?;
        if !blockchain.get_pow().validate(&block)? {
            return Ok(false);
        }
        if let Some(child) = &child {
            if child.get_prev_hash() != block.get_hash()
                || child.get_height() != block.get_height() + 1
            {
                return Ok(false);
            }
        }
        child = Some(block);
    }

    Ok(matches!(child, Some(genesis) if genesis.is_genesis() && genesis.get_height() == 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_blockchain() {
        let (_dir, chain, wallets, address) = create_test_blockchain();
        assert_eq!(chain.get_best_height().unwrap(), 0);
        assert!(wallets.get_wallet(&address).is_some());
    }

    #[test]
    fn test_validate_blockchain_integrity() {
        let (_dir, chain, mut wallets, from) = create_test_blockchain();
        let to = wallets.create_wallet().unwrap();
        chain.send(&from, &to, 20, &wallets).unwrap();

        assert!(validate_blockchain_integrity(&chain).unwrap());
    }
}
