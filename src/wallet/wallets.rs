use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::{Wallet, WalletCipher};
use log::info;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const WALLET_FILE: &str = "wallets.dat";

/// Address-keyed wallet collection persisted to a single encrypted file.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
    cipher: WalletCipher,
}

impl Wallets {
    /// Loads the store at `path`, decrypting it with `passphrase`; a missing
    /// file is an empty store that will be sealed with that passphrase.
    pub fn load(path: impl AsRef<Path>, passphrase: &str) -> Result<Wallets> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Wallets {
                wallets: HashMap::new(),
                path,
                cipher: WalletCipher::generate(passphrase)?,
            });
        }

        let bytes = fs::read(&path)?;
        let (cipher, plaintext) = WalletCipher::open(&bytes, passphrase).map_err(|e| {
            BlockchainError::Wallet(format!("Could not load wallets from {}: {e}", path.display()))
        })?;
        let wallets: HashMap<String, Wallet> = deserialize(&plaintext[..]).map_err(|e| {
            BlockchainError::Wallet(format!("Could not load wallets from {}: {e}", path.display()))
        })?;
        for (address, wallet) in &wallets {
            let rebuilt = Wallet::from_private_key(wallet.get_private_key())?;
            if rebuilt != *wallet || rebuilt.get_address() != *address {
                return Err(BlockchainError::Wallet(format!(
                    "Stored wallet {address} does not match its private key"
                )));
            }
        }
        Ok(Wallets {
            wallets,
            path,
            cipher,
        })
    }

    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        self.save_to_file()?;
        info!("Created wallet {address}");
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    /// Removes a wallet; returns `false` if the address was not stored.
    pub fn delete_wallet(&mut self, address: &str) -> Result<bool> {
        if self.wallets.remove(address).is_none() {
            return Ok(false);
        }
        self.save_to_file()?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    fn save_to_file(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let plaintext = Zeroizing::new(serialize(&self.wallets)?);
        writer.write_all(&self.cipher.seal(&plaintext)?)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PASSPHRASE: &str = "correct horse battery";

    #[test]
    fn test_create_and_reload_wallet() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);

        let mut wallets = Wallets::load(&path, PASSPHRASE).unwrap();
        assert!(wallets.is_empty());
        let address = wallets.create_wallet().unwrap();

        let reloaded = Wallets::load(&path, PASSPHRASE).unwrap();
        assert_eq!(reloaded.get_addresses(), vec![address.clone()]);
        assert_eq!(reloaded.get_wallet(&address), wallets.get_wallet(&address));
    }

    #[test]
    fn test_delete_wallet() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);

        let mut wallets = Wallets::load(&path, PASSPHRASE).unwrap();
        let address = wallets.create_wallet().unwrap();
        assert!(wallets.delete_wallet(&address).unwrap());
        assert!(!wallets.delete_wallet(&address).unwrap());
        assert!(wallets.get_wallet(&address).is_none());

        let reloaded = Wallets::load(&path, PASSPHRASE).unwrap();
        assert_eq!(reloaded.len(), 0);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);
        fs::write(&path, [0xFF, 0xFF, 0xFF]).unwrap();
        assert!(matches!(
            Wallets::load(&path, PASSPHRASE),
            Err(BlockchainError::Wallet(_))
        ));
    }

    #[test]
    fn test_file_does_not_expose_private_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);

        let mut wallets = Wallets::load(&path, PASSPHRASE).unwrap();
        let address = wallets.create_wallet().unwrap();
        let private_key = wallets.get_wallet(&address).unwrap().get_private_key().to_vec();

        let on_disk = fs::read(&path).unwrap();
        assert!(!on_disk
            .windows(private_key.len())
            .any(|w| w == private_key.as_slice()));
        assert!(!on_disk
            .windows(address.len())
            .any(|w| w == address.as_bytes()));
    }

    #[test]
    fn test_wrong_passphrase_cannot_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);
        Wallets::load(&path, PASSPHRASE)
            .unwrap()
            .create_wallet()
            .unwrap();

        assert!(matches!(
            Wallets::load(&path, "another passphrase"),
            Err(BlockchainError::Wallet(_))
        ));
        assert_eq!(Wallets::load(&path, PASSPHRASE).unwrap().len(), 1);
    }
}
