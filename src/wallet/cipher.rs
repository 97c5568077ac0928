//! At-rest encryption for the wallet file
//!
//! The file holds a salt, a nonce and the AES-256-GCM ciphertext of the
//! bincode-encoded wallet map. The key is derived from a passphrase with
//! Argon2id and the salt; a fresh nonce is drawn for every write.

use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{ZeroizeOnDrop, Zeroizing};

pub const MIN_PASSPHRASE_LEN: usize = 8;

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

// On-disk layout of the wallet file
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct SealedWallets {
    salt: Vec<u8>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

#[derive(ZeroizeOnDrop)]
struct SecretKey([u8; KEY_LEN]);

/// A passphrase-derived key bound to the salt it was derived with.
pub struct WalletCipher {
    key: SecretKey,
    salt: Vec<u8>,
}

impl std::fmt::Debug for WalletCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletCipher")
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

impl WalletCipher {
    /// A cipher for a new file, with a freshly drawn salt.
    pub fn generate(passphrase: &str) -> Result<WalletCipher> {
        WalletCipher::derive(passphrase, random_bytes(SALT_LEN))
    }

    fn derive(passphrase: &str, salt: Vec<u8>) -> Result<WalletCipher> {
        if passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(BlockchainError::Wallet(format!(
                "wallet passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
            )));
        }

        let params = Params::new(
            Params::DEFAULT_M_COST,
            Params::DEFAULT_T_COST,
            Params::DEFAULT_P_COST,
            Some(KEY_LEN),
        )
        .map_err(|e| BlockchainError::Crypto(format!("Invalid Argon2 parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = SecretKey([0u8; KEY_LEN]);
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key.0)
            .map_err(|e| BlockchainError::Crypto(format!("Key derivation failed: {e}")))?;
        Ok(WalletCipher { key, salt })
    }

    /// Decrypts a wallet file, returning the plaintext and the cipher to
    /// write it back with.
    pub fn open(bytes: &[u8], passphrase: &str) -> Result<(WalletCipher, Zeroizing<Vec<u8>>)> {
        let sealed: SealedWallets = deserialize(bytes)
            .map_err(|e| BlockchainError::Wallet(format!("Unreadable wallet file: {e}")))?;
        if sealed.nonce.len() != NONCE_LEN {
            return Err(BlockchainError::Wallet(format!(
                "wallet file nonce has {} bytes",
                sealed.nonce.len()
            )));
        }

        let cipher = WalletCipher::derive(passphrase, sealed.salt)?;
        let plaintext = cipher
            .aead()
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| {
                BlockchainError::Wallet(
                    "could not decrypt wallet file: wrong passphrase or corrupt data".to_string(),
                )
            })?;
        Ok((cipher, Zeroizing::new(plaintext)))
    }

    /// Encrypts `plaintext` under a fresh nonce into the file layout.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = random_bytes(NONCE_LEN);
        let ciphertext = self
            .aead()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| BlockchainError::Crypto(format!("AES-256-GCM encryption failed: {e}")))?;

        serialize(&SealedWallets {
            salt: self.salt.clone(),
            nonce,
            ciphertext,
        })
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key.0))
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
