// Value moves through unspent outputs: every input points at an output of an
// earlier transaction and proves ownership with a signature, every output
// locks an amount to a public key hash.

use crate::error::{BlockchainError, Result};
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest,
};
use crate::wallet::{hash_pub_key, pub_key_hash_from_address};
use data_encoding::HEXLOWER;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Output index carried by the single input of a coinbase transaction.
pub const COINBASE_OUTPUT_INDEX: i32 = -1;

// A reference to output `prev_output_index` of transaction `prev_txid`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXInput {
    prev_txid: Vec<u8>,
    prev_output_index: i32,
    signature: Option<Vec<u8>>,  // r ‖ s once signed
    public_key: Option<Vec<u8>>, // x ‖ y of the spender, or the coinbase memo
}

impl TXInput {
    /// An unsigned input that will be signed by the owner of `public_key`.
    pub fn new(prev_txid: &[u8], prev_output_index: i32, public_key: &[u8]) -> TXInput {
        TXInput {
            prev_txid: prev_txid.to_vec(),
            prev_output_index,
            signature: None,
            public_key: Some(public_key.to_vec()),
        }
    }

    pub fn get_prev_txid(&self) -> &[u8] {
        self.prev_txid.as_slice()
    }

    pub fn get_prev_output_index(&self) -> i32 {
        self.prev_output_index
    }

    pub fn get_signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn get_public_key(&self) -> Option<&[u8]> {
        self.public_key.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: i64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Locks `value` to the public key hash encoded in `address`.
    pub fn new(value: i64, address: &str) -> Result<TXOutput> {
        if value < 0 {
            return Err(BlockchainError::InvalidTransaction(format!(
                "output value must not be negative, got {value}"
            )));
        }
        let pub_key_hash = pub_key_hash_from_address(address)?;
        Ok(TXOutput {
            value,
            pub_key_hash,
        })
    }

    pub fn get_value(&self) -> i64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Mints `reward` to `to`. An empty memo is replaced with a random UUID
    /// so repeated rewards to the same address still get distinct ids.
    pub fn new_coinbase_tx(to: &str, memo: &str, reward: i64) -> Result<Transaction> {
        let txout = TXOutput::new(reward, to)?;
        let memo = if memo.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            memo.to_string()
        };
        let tx_input = TXInput {
            prev_txid: vec![],
            prev_output_index: COINBASE_OUTPUT_INDEX,
            signature: None,
            public_key: Some(memo.into_bytes()),
        };

        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![txout],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// An unsigned spend. The id covers everything except signatures and
    /// public keys, so signing does not change it.
    pub fn new_spend(inputs: Vec<TXInput>, outputs: Vec<TXOutput>) -> Result<Transaction> {
        if inputs.is_empty() {
            return Err(BlockchainError::InvalidTransaction(
                "spend has no inputs".to_string(),
            ));
        }
        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };
        tx.id = tx.trimmed_copy().hash()?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1
            && self.vin[0].prev_txid.is_empty()
            && self.vin[0].prev_output_index == COINBASE_OUTPUT_INDEX
    }

    /// sha256 of the serialized transaction with its id cleared.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    // Same transaction with every signature and public key blanked
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .vin
            .iter()
            .map(|input| TXInput {
                prev_txid: input.prev_txid.clone(),
                prev_output_index: input.prev_output_index,
                signature: None,
                public_key: None,
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin: inputs,
            vout: self.vout.clone(),
        }
    }

    // The prior output an input spends, if it can be resolved
    fn prev_output<'a>(
        input: &TXInput,
        prev_txs: &'a HashMap<String, Transaction>,
    ) -> Option<&'a TXOutput> {
        let prev_tx = prev_txs.get(&HEXLOWER.encode(&input.prev_txid))?;
        let index = usize::try_from(input.prev_output_index).ok()?;
        prev_tx.vout.get(index)
    }

    /// Signs every input with `pkcs8`.
    ///
    /// Each input signs its own payload: the trimmed copy in which that input
    /// and every input before it hold, in their public key slot, the pubkey
    /// hash of the output they spend. `prev_txs` maps hex txid to the
    /// transactions being spent.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut payload = self.trimmed_copy();
        for (idx, vin) in self.vin.iter_mut().enumerate() {
            let txid_hex = HEXLOWER.encode(&vin.prev_txid);
            if !prev_txs.contains_key(&txid_hex) {
                return Err(BlockchainError::UnknownTransaction(txid_hex));
            }
            let prev_out = Self::prev_output(vin, prev_txs).ok_or_else(|| {
                BlockchainError::InvalidTransaction(format!(
                    "output {} of {txid_hex} does not exist",
                    vin.prev_output_index
                ))
            })?;

            payload.vin[idx].public_key = Some(prev_out.pub_key_hash.clone());
            payload.id = payload.hash()?;

            vin.signature = Some(ecdsa_p256_sha256_sign_digest(pkcs8, &payload.id)?);
        }
        Ok(())
    }

    /// Checks every input's signature and ownership. Coinbase transactions
    /// always verify; a spend without inputs never does. Anything
    /// unresolvable is a failure, not an error.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> bool {
        if self.is_coinbase() {
            return true;
        }
        if self.vin.is_empty() {
            warn!("Transaction {} spends nothing", self.get_id_hex());
            return false;
        }

        let mut payload = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            let (Some(signature), Some(public_key)) = (&vin.signature, &vin.public_key) else {
                warn!("Input {idx} of {} is not signed", self.get_id_hex());
                return false;
            };
            let Some(prev_out) = Self::prev_output(vin, prev_txs) else {
                warn!(
                    "Input {idx} of {} spends an unknown output",
                    self.get_id_hex()
                );
                return false;
            };
            if hash_pub_key(public_key) != prev_out.pub_key_hash {
                warn!(
                    "Input {idx} of {} is signed by a key that does not own the output",
                    self.get_id_hex()
                );
                return false;
            }

            payload.vin[idx].public_key = Some(prev_out.pub_key_hash.clone());
            payload.id = match payload.hash() {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Could not hash signing payload: {e}");
                    return false;
                }
            };

            if !ecdsa_p256_sha256_sign_verify(public_key, signature, &payload.id) {
                warn!("Input {idx} of {} has a bad signature", self.get_id_hex());
                return false;
            }
        }
        true
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    /// Sum of all outputs, or `None` if it overflows.
    pub fn output_value(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |total, out| total.checked_add(out.value))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}
