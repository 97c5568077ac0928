use crate::core::Transaction;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Transactions waiting to be mined.
///
/// ( K -> txid_hex, V => Transaction )
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(txid_hex)
            .cloned()
    }

    pub fn add(&self, tx: Transaction) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tx.get_id_hex(), tx);
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) -> Option<Transaction> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(txid_hex)
    }

    /// Drops every transaction of `txs` that is pooled.
    pub fn remove_all(&self, txs: &[Transaction]) {
        let mut pool = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for tx in txs {
            pool.remove(&tx.get_id_hex());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Block hashes announced by a peer that still have to be fetched, in the
/// order they were announced.
pub struct BlockInTransit {
    inner: RwLock<Vec<Vec<u8>>>,
}

impl Default for BlockInTransit {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit {
            inner: RwLock::new(vec![]),
        }
    }

    /// Replaces the pending list with `blocks`.
    pub fn set_blocks(&self, blocks: &[Vec<u8>]) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = blocks.to_vec();
    }

    pub fn first(&self) -> Option<Vec<u8>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub fn remove(&self, block_hash: &[u8]) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(idx) = inner.iter().position(|x| x.eq(block_hash)) {
            inner.remove(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn coinbase() -> Transaction {
        let wallet = Wallet::new().unwrap();
        Transaction::new_coinbase_tx(&wallet.get_address(), "", 50).unwrap()
    }

    #[test]
    fn test_memory_pool_add_get_remove() {
        let pool = MemoryPool::new();
        let tx = coinbase();
        let txid = tx.get_id_hex();

        pool.add(tx.clone());
        assert!(pool.contains(&txid));
        assert_eq!(pool.get(&txid), Some(tx.clone()));
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.remove(&txid), Some(tx));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_memory_pool_remove_all() {
        let pool = MemoryPool::new();
        let a = coinbase();
        let b = coinbase();
        let c = coinbase();
        pool.add(a.clone());
        pool.add(b.clone());
        pool.add(c.clone());

        pool.remove_all(&[a, b]);
        assert_eq!(pool.get_all(), vec![c]);
    }

    #[test]
    fn test_block_in_transit() {
        let transit = BlockInTransit::new();
        transit.set_blocks(&[vec![1], vec![2], vec![3]]);
        assert_eq!(transit.first(), Some(vec![1]));

        transit.remove(&[1]);
        assert_eq!(transit.first(), Some(vec![2]));
        assert_eq!(transit.len(), 2);

        transit.set_blocks(&[vec![9]]);
        assert_eq!(transit.len(), 1);
        transit.remove(&[9]);
        assert!(transit.is_empty());
    }
}
