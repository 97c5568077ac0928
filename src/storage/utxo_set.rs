use crate::core::{Block, Blockchain, TXOutput};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Batch, Tree};
use std::collections::{BTreeMap, HashMap, HashSet};

const UTXO_TREE: &str = "utxo";

/// An output that has not been spent yet, with its position in the
/// transaction that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UnspentOutput {
    index: i32,
    output: TXOutput,
}

impl UnspentOutput {
    pub fn get_index(&self) -> i32 {
        self.index
    }

    pub fn get_output(&self) -> &TXOutput {
        &self.output
    }
}

/// ( K -> txid, V -> Vec<UnspentOutput> )
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    fn utxo_tree(&self) -> Result<Tree> {
        self.blockchain
            .get_db()
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO tree: {e}")))
    }

    fn decode_entry(bytes: &[u8]) -> Result<Vec<UnspentOutput>> {
        deserialize(bytes).map_err(|e| {
            BlockchainError::Serialization(format!("Failed to deserialize unspent outputs: {e}"))
        })
    }

    /// Every unspent output locked to `pub_key_hash`, as `(txid_hex, entry)`
    /// in key order.
    pub fn find_unspent_outputs(&self, pub_key_hash: &[u8]) -> Result<Vec<(String, UnspentOutput)>> {
        let mut found = vec![];
        for item in self.utxo_tree()?.iter() {
            let (k, v) = item?;
            let txid_hex = HEXLOWER.encode(k.as_ref());
            for out in Self::decode_entry(v.as_ref())? {
                if out.output.is_locked_with_key(pub_key_hash) {
                    found.push((txid_hex.clone(), out));
                }
            }
        }
        Ok(found)
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        Ok(self
            .find_unspent_outputs(pub_key_hash)?
            .into_iter()
            .map(|(_, out)| out.output)
            .collect())
    }

    /// Picks outputs in key order until they cover `amount`. The returned
    /// total may fall short; callers decide whether that is an error.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, BTreeMap<String, Vec<i32>>)> {
        let mut unspent_outputs: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        let mut accumulated = 0;

        'outer: for item in self.utxo_tree()?.iter() {
            let (k, v) = item?;
            let txid_hex = HEXLOWER.encode(k.as_ref());
            for out in Self::decode_entry(v.as_ref())? {
                if accumulated >= amount {
                    break 'outer;
                }
                if out.output.is_locked_with_key(pub_key_hash) {
                    accumulated = out.output.get_value().saturating_add(accumulated);
                    unspent_outputs
                        .entry(txid_hex.clone())
                        .or_default()
                        .push(out.index);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    /// Number of transactions that still have unspent outputs.
    pub fn count_transactions(&self) -> Result<u64> {
        let mut counter = 0;
        for item in self.utxo_tree()?.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Rebuilds the index from the whole chain and swaps it in with one
    /// atomic batch.
    pub fn reindex(&self) -> Result<()> {
        let utxo_tree = self.utxo_tree()?;

        // Collect every spent reference first, so an output spent later in
        // the same block or in a descendant block is never indexed.
        let mut blocks = vec![];
        let mut spent: HashSet<(Vec<u8>, i32)> = HashSet::new();
        for block in self.blockchain.iterator() {
            let block = block?;
            for tx in block.get_transactions() {
                if tx.is_coinbase() {
                    continue;
                }
                for vin in tx.get_vin() {
                    spent.insert((vin.get_prev_txid().to_vec(), vin.get_prev_output_index()));
                }
            }
            blocks.push(block);
        }

        let mut utxo: HashMap<Vec<u8>, Vec<UnspentOutput>> = HashMap::new();
        for block in &blocks {
            for tx in block.get_transactions() {
                let txid = tx.get_id().to_vec();
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    let index = i32::try_from(idx).map_err(|_| {
                        BlockchainError::InvalidTransaction(format!(
                            "transaction {} has too many outputs",
                            tx.get_id_hex()
                        ))
                    })?;
                    if spent.contains(&(txid.clone(), index)) {
                        continue;
                    }
                    utxo.entry(txid.clone()).or_default().push(UnspentOutput {
                        index,
                        output: out.clone(),
                    });
                }
            }
        }

        let mut batch = Batch::default();
        for key in utxo_tree.iter().keys() {
            batch.remove(key?);
        }
        for (txid, outs) in &utxo {
            batch.insert(txid.as_slice(), serialize(outs)?);
        }
        utxo_tree
            .apply_batch(batch)
            .map_err(|e| BlockchainError::Database(format!("Failed to rebuild UTXO tree: {e}")))?;

        info!(
            "Reindexed UTXO set: {} transaction(s) with unspent outputs",
            utxo.len()
        );
        Ok(())
    }

    /// Applies one block: drops the outputs its inputs spend and adds the
    /// outputs it creates, in a single store transaction.
    pub fn update(&self, block: &Block) -> Result<()> {
        let utxo_tree = self.utxo_tree()?;

        let mut created = Vec::with_capacity(block.get_transactions().len());
        for tx in block.get_transactions() {
            let mut outs = Vec::with_capacity(tx.get_vout().len());
            for (idx, out) in tx.get_vout().iter().enumerate() {
                let index = i32::try_from(idx).map_err(|_| {
                    BlockchainError::InvalidTransaction(format!(
                        "transaction {} has too many outputs",
                        tx.get_id_hex()
                    ))
                })?;
                outs.push(UnspentOutput {
                    index,
                    output: out.clone(),
                });
            }
            created.push(serialize(&outs)?);
        }

        utxo_tree
            .transaction(|tx_db| {
                for (tx, outs_bytes) in block.get_transactions().iter().zip(&created) {
                    if !tx.is_coinbase() {
                        for vin in tx.get_vin() {
                            let Some(entry) = tx_db.get(vin.get_prev_txid())? else {
                                continue;
                            };
                            let mut outs = Self::decode_entry(entry.as_ref())
                                .map_err(ConflictableTransactionError::Abort)?;
                            outs.retain(|out| out.index != vin.get_prev_output_index());

                            if outs.is_empty() {
                                tx_db.remove(vin.get_prev_txid())?;
                            } else {
                                let updated =
                                    serialize(&outs).map_err(ConflictableTransactionError::Abort)?;
                                tx_db.insert(vin.get_prev_txid(), updated)?;
                            }
                        }
                    }
                    tx_db.insert(tx.get_id(), outs_bytes.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError<BlockchainError>| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => {
                    BlockchainError::Database(format!("Failed to update UTXO set: {err}"))
                }
            })
    }
}
