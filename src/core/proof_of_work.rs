use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_DIFFICULTY: usize = 4;

const MAX_NONCE: u64 = u64::MAX;

/// Nonce search over `prev_hash ‖ merkle_root ‖ placeholder ‖ hex(nonce)`.
///
/// A digest meets the target when its lowercase hex rendering starts with
/// `difficulty` zero digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty: usize,
    max_nonce: u64,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        ProofOfWork::new(DEFAULT_DIFFICULTY)
    }
}

impl ProofOfWork {
    pub fn new(difficulty: usize) -> ProofOfWork {
        ProofOfWork {
            difficulty,
            max_nonce: MAX_NONCE,
        }
    }

    /// Caps the search space; nonces `0..=max_nonce` are tried.
    pub fn with_max_nonce(mut self, max_nonce: u64) -> ProofOfWork {
        self.max_nonce = max_nonce;
        self
    }

    pub fn get_difficulty(&self) -> usize {
        self.difficulty
    }

    /// The hash field is still empty when a block is sealed, so the
    /// placeholder contributes no bytes.
    pub fn prepare_data(prev_hash: &[u8], merkle_root: &[u8], nonce: u64) -> Vec<u8> {
        let placeholder: &[u8] = &[];
        let nonce_hex = format!("{nonce:x}");
        let mut data_bytes =
            Vec::with_capacity(prev_hash.len() + merkle_root.len() + nonce_hex.len());
        data_bytes.extend_from_slice(prev_hash);
        data_bytes.extend_from_slice(merkle_root);
        data_bytes.extend_from_slice(placeholder);
        data_bytes.extend_from_slice(nonce_hex.as_bytes());
        data_bytes
    }

    pub fn meets_target(&self, hash: &[u8]) -> bool {
        let hex = HEXLOWER.encode(hash);
        hex.len() >= self.difficulty && hex.bytes().take(self.difficulty).all(|c| c == b'0')
    }

    /// Searches nonces from zero until the digest meets the target.
    ///
    /// `cancel` is polled between attempts; once set the search stops with
    /// [`BlockchainError::MiningCancelled`].
    pub fn run(
        &self,
        prev_hash: &[u8],
        merkle_root: &[u8],
        cancel: &AtomicBool,
    ) -> Result<(u64, Vec<u8>)> {
        debug!("Mining at difficulty {}", self.difficulty);
        let mut nonce: u64 = 0;
        loop {
            if cancel.load(Ordering::Relaxed) {
                info!("Mining cancelled at nonce {nonce}");
                return Err(BlockchainError::MiningCancelled);
            }

            let data = Self::prepare_data(prev_hash, merkle_root, nonce);
            let hash = sha256_digest(data.as_slice());
            if self.meets_target(&hash) {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                return Ok((nonce, hash));
            }

            if nonce >= self.max_nonce {
                return Err(BlockchainError::ProofNotFound {
                    attempts: nonce.saturating_add(1),
                });
            }
            nonce += 1;
        }
    }

    /// Recomputes the digest from the block's own fields and checks it is
    /// both the stored hash and under the target.
    pub fn validate(&self, block: &Block) -> Result<bool> {
        let merkle_root = block.hash_transactions()?;
        let data = Self::prepare_data(block.get_prev_hash(), &merkle_root, block.get_nonce());
        let hash = sha256_digest(data.as_slice());
        Ok(hash.as_slice() == block.get_hash() && self.meets_target(&hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_data_layout() {
        let data = ProofOfWork::prepare_data(b"prev", b"root", 255);
        assert_eq!(data, b"prevrootff".to_vec());

        let data = ProofOfWork::prepare_data(&[], b"root", 0);
        assert_eq!(data, b"root0".to_vec());
    }

    #[test]
    fn test_meets_target() {
        let pow = ProofOfWork::new(2);
        assert!(pow.meets_target(&[0x00, 0xff]));
        assert!(!pow.meets_target(&[0x01, 0xff]));
        assert!(!pow.meets_target(&[0x10, 0x00]));
        assert!(ProofOfWork::new(0).meets_target(&[0xff]));
    }

    #[test]
    fn test_run_finds_valid_nonce() {
        let pow = ProofOfWork::new(2);
        let cancel = AtomicBool::new(false);
        let (nonce, hash) = pow.run(b"prev", b"root", &cancel).unwrap();

        let expected = sha256_digest(&ProofOfWork::prepare_data(b"prev", b"root", nonce));
        assert_eq!(hash, expected);
        assert!(HEXLOWER.encode(&hash).starts_with("00"));
    }

    #[test]
    fn test_run_reports_exhausted_search() {
        // 64 zero hex digits cannot be reached in two attempts
        let pow = ProofOfWork::new(64).with_max_nonce(1);
        let cancel = AtomicBool::new(false);
        assert_eq!(
            pow.run(b"prev", b"root", &cancel),
            Err(BlockchainError::ProofNotFound { attempts: 2 })
        );
    }

    #[test]
    fn test_run_honours_cancel_flag() {
        let pow = ProofOfWork::new(64);
        let cancel = AtomicBool::new(true);
        assert_eq!(
            pow.run(b"prev", b"root", &cancel),
            Err(BlockchainError::MiningCancelled)
        );
    }
}
