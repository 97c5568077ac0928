use ring::digest::{Context, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use ripemd::{Digest as RipemdDigest, Ripemd160};

use crate::error::{BlockchainError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Byte length of one P-256 coordinate or signature scalar.
const P256_SCALAR_LEN: usize = 32;
/// SEC1 tag for an uncompressed curve point.
const UNCOMPRESSED_POINT_TAG: u8 = 0x04;

pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BlockchainError::Crypto(format!("System time error: {e}")))?
        .as_millis();

    if duration > i64::MAX as u128 {
        return Err(BlockchainError::Crypto("Timestamp overflow".to_string()));
    }

    Ok(duration as i64)
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

/// sha256(sha256(data))
pub fn double_sha256_digest(data: &[u8]) -> Vec<u8> {
    sha256_digest(sha256_digest(data).as_slice())
}

pub fn ripemd160_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(data: &str) -> Result<Vec<u8>> {
    bs58::decode(data)
        .into_vec()
        .map_err(|e| BlockchainError::InvalidAddress(format!("Invalid base58 encoding: {e}")))
}

/// Generates a fresh P-256 key pair and returns `(pkcs8, public_key)`.
///
/// The public key is the raw `x ‖ y` concatenation (64 bytes), without the
/// SEC1 uncompressed-point tag.
pub fn new_key_pair() -> Result<(Vec<u8>, Vec<u8>)> {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to generate ECDSA key pair: {e}")))?
        .as_ref()
        .to_vec();
    let public_key = public_key_from_pkcs8(&pkcs8)?;
    Ok((pkcs8, public_key))
}

/// Recovers the raw `x ‖ y` public key from a PKCS#8 private key document.
pub fn public_key_from_pkcs8(pkcs8: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| {
            BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
        })?;
    let point = key_pair.public_key().as_ref();
    match point.split_first() {
        Some((&UNCOMPRESSED_POINT_TAG, xy)) => Ok(xy.to_vec()),
        _ => Err(BlockchainError::Crypto(
            "Unexpected public key encoding".to_string(),
        )),
    }
}

/// Signs `message` and returns the fixed-width big-endian `r ‖ s` signature.
pub fn ecdsa_p256_sha256_sign_digest(pkcs8: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| {
            BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
        })?;
    let signature = key_pair
        .sign(&rng, message)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to sign message: {e}")))?
        .as_ref()
        .to_vec();
    Ok(signature)
}

/// Verifies an `r ‖ s` signature against a raw `x ‖ y` public key.
///
/// Both byte strings are split in half; odd lengths, empty input or halves
/// wider than a P-256 scalar fail verification instead of erroring.
pub fn ecdsa_p256_sha256_sign_verify(public_key: &[u8], signature: &[u8], message: &[u8]) -> bool {
    let Some((x, y)) = split_halves(public_key) else {
        return false;
    };
    let Some((r, s)) = split_halves(signature) else {
        return false;
    };

    let mut point = Vec::with_capacity(1 + 2 * P256_SCALAR_LEN);
    point.push(UNCOMPRESSED_POINT_TAG);
    point.extend(left_pad(x));
    point.extend(left_pad(y));

    let mut fixed_signature = Vec::with_capacity(2 * P256_SCALAR_LEN);
    fixed_signature.extend(left_pad(r));
    fixed_signature.extend(left_pad(s));

    let peer_public_key = UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point);
    peer_public_key.verify(message, &fixed_signature).is_ok()
}

fn split_halves(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    if bytes.is_empty() || bytes.len() % 2 != 0 || bytes.len() > 2 * P256_SCALAR_LEN {
        return None;
    }
    Some(bytes.split_at(bytes.len() / 2))
}

fn left_pad(bytes: &[u8]) -> Vec<u8> {
    let mut padded = vec![0u8; P256_SCALAR_LEN - bytes.len()];
    padded.extend_from_slice(bytes);
    padded
}
