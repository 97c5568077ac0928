//! Utility functions and helpers
//!
//! Hashing, base58, ECDSA helpers and the bincode wrappers every stored or
//! transmitted structure goes through.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, double_sha256_digest,
    ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, new_key_pair,
    public_key_from_pkcs8, ripemd160_digest, sha256_digest,
};

pub use serialization::{deserialize, serialize};
