//! Wallet management
//!
//! Key pairs, address derivation/validation and the encrypted on-disk
//! wallet store.

pub mod cipher;
#[allow(clippy::module_inception)]
pub mod wallet;
pub mod wallets;

pub use wallet::{
    convert_address, hash_pub_key, pub_key_hash_from_address, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN, ADDRESS_VERSION,
};
pub use cipher::{WalletCipher, MIN_PASSPHRASE_LEN};
pub use wallets::{Wallets, WALLET_FILE};
