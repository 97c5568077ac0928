use crate::error::{BlockchainError, Result};
use crate::utils::{base58_decode, base58_encode, double_sha256_digest, ripemd160_digest, sha256_digest};
use serde::{Deserialize, Serialize};

pub const ADDRESS_VERSION: u8 = 0x01;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;
pub const PUB_KEY_HASH_LEN: usize = 20;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Wallet {
    private_key: Vec<u8>, // PKCS#8 document
    public_key: Vec<u8>,  // x ‖ y
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.get_address())
            .finish_non_exhaustive()
    }
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let (private_key, public_key) = crate::utils::new_key_pair()?;
        Ok(Wallet {
            private_key,
            public_key,
        })
    }

    /// Rebuilds a wallet from a stored PKCS#8 private key.
    pub fn from_private_key(private_key: &[u8]) -> Result<Wallet> {
        let public_key = crate::utils::public_key_from_pkcs8(private_key)?;
        Ok(Wallet {
            private_key: private_key.to_vec(),
            public_key,
        })
    }

    pub fn get_address(&self) -> String {
        convert_address(hash_pub_key(self.public_key.as_slice()).as_slice())
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    pub fn get_private_key(&self) -> &[u8] {
        self.private_key.as_slice()
    }

    pub fn get_pub_key_hash(&self) -> Vec<u8> {
        hash_pub_key(self.public_key.as_slice())
    }
}

/// ripemd160(sha256(pub_key))
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let pub_key_sha256 = sha256_digest(pub_key);
    ripemd160_digest(pub_key_sha256.as_slice())
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    double_sha256_digest(payload)[0..ADDRESS_CHECK_SUM_LEN].to_vec()
}

pub fn validate_address(address: &str) -> bool {
    pub_key_hash_from_address(address).is_ok()
}

/// Decodes an address into the public key hash it locks to, checking the
/// payload length and checksum.
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>> {
    let payload = base58_decode(address)?;
    if payload.len() != 1 + PUB_KEY_HASH_LEN + ADDRESS_CHECK_SUM_LEN {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: unexpected payload length {}",
            payload.len()
        )));
    }

    let (versioned, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    if checksum(versioned) != actual_checksum {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: checksum mismatch"
        )));
    }
    Ok(versioned[1..].to_vec())
}

pub fn convert_address(pub_hash_key: &[u8]) -> String {
    let mut payload: Vec<u8> = vec![];
    payload.push(ADDRESS_VERSION);
    payload.extend(pub_hash_key);
    let checksum = checksum(payload.as_slice());
    payload.extend(checksum.as_slice());
    // version + pub_key_hash + checksum
    base58_encode(payload.as_slice())
}
