// The ledger: every block ever accepted lives in the `blocks` tree keyed by
// its hash, and a single key tracks the tip of the highest chain seen. Only
// blocks whose ancestry back to a genesis block is stored and valid enter
// `blocks`; blocks that arrive before their parent wait in `orphans`. The
// unspent-output index in `utxo` is derived from it and can always be rebuilt.

use crate::core::{Block, ProofOfWork, TXInput, TXOutput, Transaction, DEFAULT_DIFFICULTY};
use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::wallet::{pub_key_hash_from_address, Wallet, Wallets};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "1";
const BLOCKS_TREE: &str = "blocks";
const ORPHANS_TREE: &str = "orphans";
const MAX_ORPHANS: usize = 256;

pub const DEFAULT_BLOCK_REWARD: i64 = 50;
pub const DEFAULT_GENESIS_DATA: &str = "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Consensus and issuance parameters every peer must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub difficulty: usize,
    pub block_reward: i64,
    pub genesis_data: String,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            difficulty: DEFAULT_DIFFICULTY,
            block_reward: DEFAULT_BLOCK_REWARD,
            genesis_data: DEFAULT_GENESIS_DATA.to_string(),
        }
    }
}

/// Outcome of [`Blockchain::append_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// The hash was already stored; nothing changed.
    AlreadyKnown,
    /// The parent is unknown; the block waits until it arrives.
    Orphan,
    /// Stored, but not higher than the current tip.
    Stored,
    /// Stored and now the tip, directly or through orphans it connected.
    NewTip,
}

type Outpoint = (Vec<u8>, i32);

fn outpoint(input: &TXInput) -> Outpoint {
    (input.get_prev_txid().to_vec(), input.get_prev_output_index())
}

// What a batch of transactions needs to know about the chain below it: the
// transactions it spends from, and which of its outpoints are already spent.
#[derive(Default)]
struct ChainView {
    transactions: HashMap<String, Transaction>,
    spent: HashSet<Outpoint>,
}

#[derive(Clone)]
pub struct Blockchain {
    tip_hash: Arc<RwLock<Vec<u8>>>,
    // One append at a time, so an orphan is never filed after its parent
    // already looked for it
    append_lock: Arc<Mutex<()>>,
    db: Db,
    pow: ProofOfWork,
    params: ChainParams,
}

impl Blockchain {
    /// Opens the chain at `path`, creating a genesis block that pays
    /// `genesis_address` if the store is empty. The UTXO index is rebuilt
    /// either way.
    pub fn init_chain(
        path: impl AsRef<Path>,
        genesis_address: &str,
        params: ChainParams,
    ) -> Result<Blockchain> {
        let db = sled::open(path.as_ref())
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks_tree = Self::open_blocks_tree(&db)?;
        let pow = ProofOfWork::new(params.difficulty);

        let tip_hash = match blocks_tree.get(TIP_BLOCK_HASH_KEY)? {
            Some(data) => data.to_vec(),
            None => {
                info!("Creating genesis block for address: {genesis_address}");
                let coinbase_tx = Transaction::new_coinbase_tx(
                    genesis_address,
                    &params.genesis_data,
                    params.block_reward,
                )?;
                let block =
                    Block::generate_genesis_block(&coinbase_tx, &pow, &AtomicBool::new(false))?;
                Self::update_blocks_tree(&blocks_tree, &block)?;
                block.get_hash().to_vec()
            }
        };

        let blockchain = Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash)),
            append_lock: Arc::new(Mutex::new(())),
            db,
            pow,
            params,
        };
        blockchain.utxo_set().reindex()?;
        Ok(blockchain)
    }

    /// Opens an existing chain; fails if `path` holds none.
    pub fn open(path: impl AsRef<Path>, params: ChainParams) -> Result<Blockchain> {
        let db = sled::open(path.as_ref())
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks_tree = Self::open_blocks_tree(&db)?;

        let tip_hash = blocks_tree
            .get(TIP_BLOCK_HASH_KEY)?
            .ok_or_else(|| {
                BlockchainError::Database(
                    "No existing blockchain found. Create one first.".to_string(),
                )
            })?
            .to_vec();

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash)),
            append_lock: Arc::new(Mutex::new(())),
            db,
            pow: ProofOfWork::new(params.difficulty),
            params,
        })
    }

    fn open_blocks_tree(db: &Db) -> Result<Tree> {
        db.open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))
    }

    fn blocks_tree(&self) -> Result<Tree> {
        Self::open_blocks_tree(&self.db)
    }

    fn orphans_tree(&self) -> Result<Tree> {
        self.db
            .open_tree(ORPHANS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open orphans tree: {e}")))
    }

    fn update_blocks_tree(blocks_tree: &Tree, block: &Block) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;

        blocks_tree
            .transaction(|tx_db| {
                tx_db.insert(block_hash, block_data.as_slice())?;
                tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Database(format!("Failed to update blocks tree: {e}"))
            })?;

        Ok(())
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_pow(&self) -> &ProofOfWork {
        &self.pow
    }

    pub fn get_params(&self) -> &ChainParams {
        &self.params
    }

    pub fn utxo_set(&self) -> UTXOSet {
        UTXOSet::new(self.clone())
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_tip_block(&self) -> Result<Block> {
        let tip_hash = self.get_tip_hash();
        self.get_block(&tip_hash)?.ok_or_else(|| {
            BlockchainError::Database(format!(
                "Tip block {} not found",
                HEXLOWER.encode(&tip_hash)
            ))
        })
    }

    pub fn get_best_height(&self) -> Result<u32> {
        Ok(self.get_tip_block()?.get_height())
    }

    /// Validates `transactions` and seals them into a block on top of the
    /// current tip. Nothing is persisted.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        self.mine_block_with_cancel(transactions, &AtomicBool::new(false))
    }

    /// [`Blockchain::mine_block`] with a flag that abandons the nonce search.
    pub fn mine_block_with_cancel(
        &self,
        transactions: &[Transaction],
        cancel: &AtomicBool,
    ) -> Result<Block> {
        let tip = self.get_tip_block()?;
        self.check_transactions(Some(tip.get_hash()), transactions)
            .map_err(unknown_as_invalid)?;

        let next_height = tip.get_height().checked_add(1).ok_or_else(|| {
            BlockchainError::InvalidBlock(format!(
                "no height above {} for a child of {}",
                tip.get_height(),
                tip.get_hash_hex()
            ))
        })?;
        info!(
            "Mining block at height {next_height} with {} transactions at difficulty {}",
            transactions.len(),
            self.pow.get_difficulty()
        );
        Block::seal(tip.get_hash(), transactions, next_height, &self.pow, cancel)
    }

    /// Checks `transactions` as the contents of the next block on the current
    /// tip. Fails with `UnknownTransaction` when an input spends a
    /// transaction the chain does not hold, and `InvalidTransaction` for
    /// anything else that would make the block invalid.
    pub fn validate_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        let tip_hash = self.get_tip_hash();
        self.check_transactions(Some(&tip_hash), transactions)
    }

    // Block content rules, checked against the chain ending at `parent_hash`
    // (none for a genesis block). A spend may not create more than it consumes.
    fn check_transactions(
        &self,
        parent_hash: Option<&[u8]>,
        transactions: &[Transaction],
    ) -> Result<()> {
        let view = match parent_hash {
            Some(parent_hash) => self.chain_view(parent_hash, transactions)?,
            None => ChainView::default(),
        };
        let mut claimed: HashSet<Outpoint> = HashSet::new();
        let mut coinbase_seen = false;

        for (i, tx) in transactions.iter().enumerate() {
            let invalid = |reason: &str| {
                BlockchainError::InvalidTransaction(format!(
                    "transaction {} at index {i} {reason}",
                    tx.get_id_hex()
                ))
            };

            if tx.is_coinbase() {
                if coinbase_seen {
                    return Err(invalid("is a second coinbase"));
                }
                coinbase_seen = true;
                if tx.get_vout().iter().any(|out| out.get_value() < 0) {
                    return Err(invalid("mints a negative output"));
                }
                match tx.output_value() {
                    Some(minted) if minted <= self.params.block_reward => {}
                    _ => {
                        return Err(invalid(&format!(
                            "mints more than the block reward of {}",
                            self.params.block_reward
                        )))
                    }
                }
                continue;
            }

            if tx.get_vin().is_empty() {
                return Err(invalid("has no inputs"));
            }
            if tx.get_vout().iter().any(|out| out.get_value() <= 0) {
                return Err(invalid("has an output that is not positive"));
            }
            let outputs_total = tx
                .output_value()
                .ok_or_else(|| invalid("overflows its output total"))?;

            let mut prev_txs = HashMap::new();
            let mut inputs_total: i64 = 0;
            for input in tx.get_vin() {
                let spent = outpoint(input);
                let spent_hex = format!("{}:{}", HEXLOWER.encode(&spent.0), spent.1);
                if view.spent.contains(&spent) {
                    return Err(invalid(&format!("spends {spent_hex} which is already spent")));
                }
                if !claimed.insert(spent) {
                    return Err(invalid(&format!("spends {spent_hex} twice in one block")));
                }

                let txid_hex = HEXLOWER.encode(input.get_prev_txid());
                let prev_tx = view
                    .transactions
                    .get(&txid_hex)
                    .ok_or_else(|| BlockchainError::UnknownTransaction(txid_hex.clone()))?;
                let value = usize::try_from(input.get_prev_output_index())
                    .ok()
                    .and_then(|index| prev_tx.get_vout().get(index))
                    .map(TXOutput::get_value)
                    .ok_or_else(|| invalid(&format!("spends missing output {spent_hex}")))?;
                inputs_total = inputs_total
                    .checked_add(value)
                    .ok_or_else(|| invalid("overflows its input total"))?;
                prev_txs.insert(txid_hex, prev_tx.clone());
            }

            if !tx.verify(&prev_txs) {
                return Err(invalid("failed verification"));
            }
            if outputs_total > inputs_total {
                return Err(invalid(&format!(
                    "creates {outputs_total} from inputs worth {inputs_total}"
                )));
            }
        }
        Ok(())
    }

    // One walk from `tip_hash` to genesis collecting what `transactions` spend
    fn chain_view(&self, tip_hash: &[u8], transactions: &[Transaction]) -> Result<ChainView> {
        let wanted: HashSet<Outpoint> = transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(Transaction::get_vin)
            .map(outpoint)
            .collect();
        let mut view = ChainView::default();
        if wanted.is_empty() {
            return Ok(view);
        }
        let wanted_txids: HashSet<&[u8]> = wanted.iter().map(|(txid, _)| txid.as_slice()).collect();

        for block in BlockchainIterator::new(tip_hash.to_vec(), self.db.clone()) {
            for tx in block?.get_transactions() {
                if wanted_txids.contains(tx.get_id()) {
                    view.transactions.insert(tx.get_id_hex(), tx.clone());
                }
                if tx.is_coinbase() {
                    continue;
                }
                for input in tx.get_vin() {
                    let spent = outpoint(input);
                    if wanted.contains(&spent) {
                        view.spent.insert(spent);
                    }
                }
            }
        }
        Ok(view)
    }

    /// Stores a block received from anywhere.
    ///
    /// Proof of work is checked first. A block whose parent is not stored is
    /// held as an orphan and never moves the tip. Otherwise height linkage and
    /// every transaction are validated against the parent's chain before the
    /// block and the tip move in one store transaction; the tip only moves to
    /// a strictly higher block. Orphans waiting on the new block are then
    /// connected the same way.
    pub fn append_block(&self, block: &Block) -> Result<BlockStatus> {
        let _append = self
            .append_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let blocks_tree = self.blocks_tree()?;
        let orphans_tree = self.orphans_tree()?;

        if blocks_tree.contains_key(block.get_hash())?
            || orphans_tree.contains_key(block.get_hash())?
        {
            return Ok(BlockStatus::AlreadyKnown);
        }

        if !self.pow.validate(block)? {
            return Err(BlockchainError::InvalidBlock(format!(
                "proof of work does not hold for {}",
                block.get_hash_hex()
            )));
        }

        if !block.is_genesis() && !blocks_tree.contains_key(block.get_prev_hash())? {
            return self.hold_orphan(&orphans_tree, block);
        }

        let mut status = self.connect_block(&blocks_tree, block)?;

        let mut parents = vec![block.get_hash().to_vec()];
        while let Some(parent_hash) = parents.pop() {
            for child in self.take_orphans_of(&orphans_tree, &parent_hash)? {
                match self.connect_block(&blocks_tree, &child) {
                    Ok(child_status) => {
                        if child_status == BlockStatus::NewTip {
                            status = BlockStatus::NewTip;
                        }
                        parents.push(child.get_hash().to_vec());
                    }
                    Err(e) => warn!("Dropping orphan {}: {e}", child.get_hash_hex()),
                }
            }
        }
        Ok(status)
    }

    fn hold_orphan(&self, orphans_tree: &Tree, block: &Block) -> Result<BlockStatus> {
        if orphans_tree.len() >= MAX_ORPHANS {
            return Err(BlockchainError::InvalidBlock(format!(
                "cannot hold orphan {}: {MAX_ORPHANS} orphans already waiting",
                block.get_hash_hex()
            )));
        }
        orphans_tree.insert(block.get_hash(), block.serialize()?)?;
        debug!(
            "Holding block {} until its parent {} arrives",
            block.get_hash_hex(),
            HEXLOWER.encode(block.get_prev_hash())
        );
        Ok(BlockStatus::Orphan)
    }

    fn take_orphans_of(&self, orphans_tree: &Tree, parent_hash: &[u8]) -> Result<Vec<Block>> {
        let mut children = vec![];
        for entry in orphans_tree.iter() {
            let (hash, bytes) = entry?;
            let orphan = Block::deserialize(bytes.as_ref())?;
            if orphan.get_prev_hash() == parent_hash {
                orphans_tree.remove(hash)?;
                children.push(orphan);
            }
        }
        Ok(children)
    }

    // Validates a block whose parent (if any) is stored, then writes it
    fn connect_block(&self, blocks_tree: &Tree, block: &Block) -> Result<BlockStatus> {
        let parent_hash = if block.is_genesis() {
            if block.get_height() != 0 {
                return Err(BlockchainError::InvalidBlock(format!(
                    "block {} has no parent but height {}",
                    block.get_hash_hex(),
                    block.get_height()
                )));
            }
            None
        } else {
            let parent = self.get_block(block.get_prev_hash())?.ok_or_else(|| {
                BlockchainError::InvalidBlock(format!(
                    "parent of {} is not stored",
                    block.get_hash_hex()
                ))
            })?;
            if parent.get_height().checked_add(1) != Some(block.get_height()) {
                return Err(BlockchainError::InvalidBlock(format!(
                    "block {} has height {} but its parent has height {}",
                    block.get_hash_hex(),
                    block.get_height(),
                    parent.get_height()
                )));
            }
            Some(block.get_prev_hash())
        };
        self.check_transactions(parent_hash, block.get_transactions())
            .map_err(unknown_as_invalid)?;

        let block_data = block.serialize()?;
        // Held across the commit so the cached tip follows commit order
        let mut cached_tip = self
            .tip_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let became_tip = blocks_tree
            .transaction(|tx_db| {
                tx_db.insert(block.get_hash(), block_data.as_slice())?;

                let higher = match tx_db.get(TIP_BLOCK_HASH_KEY)? {
                    None => true,
                    Some(tip_hash) => match tx_db.get(tip_hash)? {
                        None => true,
                        Some(tip_bytes) => {
                            let tip_block = Block::deserialize(tip_bytes.as_ref())
                                .map_err(ConflictableTransactionError::Abort)?;
                            block.get_height() > tip_block.get_height()
                        }
                    },
                };
                if higher {
                    tx_db.insert(TIP_BLOCK_HASH_KEY, block.get_hash())?;
                }
                Ok(higher)
            })
            .map_err(|e: TransactionError<BlockchainError>| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => {
                    BlockchainError::Database(format!("Failed to add block: {err}"))
                }
            })?;

        if became_tip {
            *cached_tip = block.get_hash().to_vec();
            info!(
                "Block {} at height {} is the new tip",
                block.get_hash_hex(),
                block.get_height()
            );
            Ok(BlockStatus::NewTip)
        } else {
            debug!("Stored block {} below the tip", block.get_hash_hex());
            Ok(BlockStatus::Stored)
        }
    }

    /// Mines `transactions`, appends the block and updates the UTXO index.
    pub fn mine_and_append(&self, transactions: &[Transaction]) -> Result<Block> {
        let block = self.mine_block(transactions)?;
        self.commit_mined_block(block)
    }

    // A mined block only extends the index when it became the tip; its
    // parent was the tip then, so the incremental update applies.
    fn commit_mined_block(&self, block: Block) -> Result<Block> {
        match self.append_block(&block)? {
            BlockStatus::NewTip => {
                self.utxo_set().update(&block)?;
                info!("Successfully mined block: {}", block.get_hash_hex());
                Ok(block)
            }
            status => Err(BlockchainError::InvalidBlock(format!(
                "mined block {} did not become the tip ({status:?})",
                block.get_hash_hex()
            ))),
        }
    }

    pub fn get_balance(&self, address: &str) -> Result<i64> {
        let pub_key_hash = pub_key_hash_from_address(address)?;
        let utxos = self.utxo_set().find_utxo(&pub_key_hash)?;
        utxos
            .iter()
            .try_fold(0i64, |total, out| total.checked_add(out.get_value()))
            .ok_or_else(|| BlockchainError::Database(format!("balance of {address} overflows")))
    }

    /// Selects unspent outputs locked to `pub_key_hash` worth at least
    /// `amount`, keyed by hex txid.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, BTreeMap<String, Vec<i32>>)> {
        let (accumulated, outputs) = self
            .utxo_set()
            .find_spendable_outputs(pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(BlockchainError::InsufficientBalance {
                required: amount,
                available: accumulated,
            });
        }
        Ok((accumulated, outputs))
    }

    /// Builds an unsigned transfer of `amount` from `from` to `to`, sending
    /// any remainder back to `from`.
    pub fn build_transaction(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        wallets: &Wallets,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(BlockchainError::InvalidTransaction(format!(
                "amount must be positive, got {amount}"
            )));
        }
        pub_key_hash_from_address(to)?;
        let from_pub_key_hash = pub_key_hash_from_address(from)?;

        let (accumulated, valid_outputs) =
            self.find_spendable_outputs(&from_pub_key_hash, amount)?;
        let wallet = wallets
            .get_wallet(from)
            .ok_or_else(|| BlockchainError::UnknownWallet(from.to_string()))?;

        let mut inputs = vec![];
        for (txid_hex, outs) in valid_outputs {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::InvalidTransaction(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                inputs.push(TXInput::new(&txid, out, wallet.get_public_key()));
            }
        }

        let mut outputs = vec![TXOutput::new(amount, to)?];
        let change = accumulated - amount;
        if change > 0 {
            outputs.push(TXOutput::new(change, from)?);
        }

        Transaction::new_spend(inputs, outputs)
    }

    // The transactions `tx` spends from, keyed by hex txid
    fn prev_transactions(&self, tx: &Transaction) -> Result<HashMap<String, Transaction>> {
        let mut prev_txs = HashMap::new();
        for input in tx.get_vin() {
            let txid_hex = HEXLOWER.encode(input.get_prev_txid());
            if prev_txs.contains_key(&txid_hex) {
                continue;
            }
            let prev_tx = self.find_transaction(input.get_prev_txid())?;
            prev_txs.insert(txid_hex, prev_tx);
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, wallet: &Wallet, tx: &mut Transaction) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let prev_txs = self.prev_transactions(tx)?;
        tx.sign(wallet.get_private_key(), &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.prev_transactions(tx)?;
        Ok(tx.verify(&prev_txs))
    }

    /// Builds, signs and mines a transfer in one step.
    pub fn send(&self, from: &str, to: &str, amount: i64, wallets: &Wallets) -> Result<Block> {
        let mut tx = self.build_transaction(from, to, amount, wallets)?;
        let wallet = wallets
            .get_wallet(from)
            .ok_or_else(|| BlockchainError::UnknownWallet(from.to_string()))?;
        self.sign_transaction(wallet, &mut tx)?;
        self.mine_and_append(&[tx])
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Transaction> {
        for block in self.iterator() {
            let block = block?;
            for transaction in block.get_transactions() {
                if txid.eq(transaction.get_id()) {
                    return Ok(transaction.clone());
                }
            }
        }
        Err(BlockchainError::UnknownTransaction(HEXLOWER.encode(txid)))
    }

    pub fn block_exists(&self, block_hash: &[u8]) -> Result<bool> {
        Ok(self.blocks_tree()?.contains_key(block_hash)?)
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks_tree()?.get(block_hash)? {
            Some(block_bytes) => Ok(Some(Block::deserialize(block_bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Block hashes from the tip back to genesis.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        self.iterator()
            .map(|block| block.map(|b| b.get_hash().to_vec()))
            .collect()
    }

    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.db.clone())
    }
}

// Validation failures inside a block are the block's fault, not a lookup miss
fn unknown_as_invalid(e: BlockchainError) -> BlockchainError {
    match e {
        BlockchainError::UnknownTransaction(txid) => {
            BlockchainError::InvalidTransaction(format!("spends unknown transaction {txid}"))
        }
        other => other,
    }
}

/// Walks from a block back to genesis, following `prev_hash`.
pub struct BlockchainIterator {
    db: Db,
    current_hash: Option<Vec<u8>>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, db: Db) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: Some(tip_hash),
            db,
        }
    }

    fn load(&self, hash: &[u8]) -> Result<Block> {
        let block_tree = Blockchain::open_blocks_tree(&self.db)?;
        let data = block_tree.get(hash)?.ok_or_else(|| {
            BlockchainError::InvalidBlock(format!("missing block {}", HEXLOWER.encode(hash)))
        })?;
        Block::deserialize(data.as_ref())
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        match self.load(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.get_prev_hash().to_vec());
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::{create_test_blockchain as setup, test_params, TEST_PASSPHRASE};
    use crate::utils::{deserialize, serialize};
    use crate::wallet::{Wallet, WALLET_FILE};
    use std::thread;
    use tempfile::tempdir;

    // Same wire layout as `Transaction`, without its constructors' checks
    #[derive(bincode::Encode)]
    struct RawTransaction {
        id: Vec<u8>,
        vin: Vec<TXInput>,
        vout: Vec<RawOutput>,
    }

    #[derive(bincode::Encode)]
    struct RawOutput {
        value: i64,
        pub_key_hash: Vec<u8>,
    }

    fn forge(vin: Vec<TXInput>, vout: Vec<(i64, &str)>) -> Transaction {
        let raw = RawTransaction {
            id: vec![0xee; 32],
            vin,
            vout: vout
                .into_iter()
                .map(|(value, address)| RawOutput {
                    value,
                    pub_key_hash: pub_key_hash_from_address(address).unwrap(),
                })
                .collect(),
        };
        deserialize(&serialize(&raw).unwrap()).unwrap()
    }

    fn genesis_input(chain: &Blockchain, wallet: &Wallet) -> TXInput {
        let genesis = chain.get_tip_block().unwrap();
        let coinbase_id = genesis.get_transactions()[0].get_id().to_vec();
        TXInput::new(&coinbase_id, 0, wallet.get_public_key())
    }

    fn seal_on(
        parent: &Block,
        transactions: &[Transaction],
        height: u32,
        chain: &Blockchain,
    ) -> Block {
        Block::seal(
            parent.get_hash(),
            transactions,
            height,
            chain.get_pow(),
            &AtomicBool::new(false),
        )
        .unwrap()
    }

    #[test]
    fn test_genesis_block() {
        let (_dir, chain, _wallets, address) = setup();
        let genesis = chain.get_tip_block().unwrap();

        assert!(genesis.is_genesis());
        assert_eq!(genesis.get_height(), 0);
        assert_eq!(chain.get_best_height().unwrap(), 0);
        assert_eq!(chain.get_balance(&address).unwrap(), 50);
        assert_eq!(
            genesis.get_transactions()[0].get_vin()[0].get_public_key(),
            Some(DEFAULT_GENESIS_DATA.as_bytes())
        );
    }

    #[test]
    fn test_iterator_walks_to_genesis() {
        let (_dir, chain, mut wallets, from) = setup();
        let to = wallets.create_wallet().unwrap();
        chain.send(&from, &to, 5, &wallets).unwrap();
        chain.send(&from, &to, 5, &wallets).unwrap();

        let heights: Vec<u32> = chain
            .iterator()
            .map(|b| b.unwrap().get_height())
            .collect();
        assert_eq!(heights, vec![2, 1, 0]);
        assert_eq!(chain.get_block_hashes().unwrap().len(), 3);
    }

    #[test]
    fn test_append_block_is_idempotent() {
        let (_dir, chain, _wallets, _address) = setup();
        let genesis = chain.get_tip_block().unwrap();
        assert_eq!(
            chain.append_block(&genesis).unwrap(),
            BlockStatus::AlreadyKnown
        );
    }

    #[test]
    fn test_append_rejects_bad_proof_of_work() {
        let (_dir, chain, wallets, address) = setup();
        let mut tx = chain
            .build_transaction(&address, &address, 1, &wallets)
            .unwrap();
        chain
            .sign_transaction(wallets.get_wallet(&address).unwrap(), &mut tx)
            .unwrap();
        let block = chain.mine_block(&[tx]).unwrap();

        let strict = Blockchain {
            pow: ProofOfWork::new(40),
            ..chain.clone()
        };
        assert!(matches!(
            strict.append_block(&block),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(chain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_lower_block_does_not_move_tip() {
        let (_dir, chain, mut wallets, from) = setup();
        let to = wallets.create_wallet().unwrap();

        // Two competing children of genesis
        let coinbase_a = Transaction::new_coinbase_tx(&to, "a", 50).unwrap();
        let coinbase_b = Transaction::new_coinbase_tx(&to, "b", 50).unwrap();
        let block_a = chain.mine_block(&[coinbase_a]).unwrap();
        let block_b = chain.mine_block(&[coinbase_b]).unwrap();

        assert_eq!(chain.append_block(&block_a).unwrap(), BlockStatus::NewTip);
        assert_eq!(chain.append_block(&block_b).unwrap(), BlockStatus::Stored);
        assert_eq!(chain.get_tip_hash(), block_a.get_hash().to_vec());
        assert!(chain.block_exists(block_b.get_hash()).unwrap());
        assert_eq!(chain.get_balance(&from).unwrap(), 50);
    }

    #[test]
    fn test_wrong_height_is_rejected() {
        let (_dir, chain, _wallets, address) = setup();
        let genesis = chain.get_tip_block().unwrap();
        let coinbase = Transaction::new_coinbase_tx(&address, "", 50).unwrap();
        let block = Block::seal(
            genesis.get_hash(),
            &[coinbase],
            5,
            chain.get_pow(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert!(matches!(
            chain.append_block(&block),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert!(!chain.block_exists(block.get_hash()).unwrap());
    }

    #[test]
    fn test_double_spend_in_batch_is_rejected() {
        let (_dir, chain, mut wallets, from) = setup();
        let to = wallets.create_wallet().unwrap();
        let wallet = wallets.get_wallet(&from).unwrap().clone();

        let mut first = chain.build_transaction(&from, &to, 10, &wallets).unwrap();
        let mut second = chain.build_transaction(&from, &to, 20, &wallets).unwrap();
        chain.sign_transaction(&wallet, &mut first).unwrap();
        chain.sign_transaction(&wallet, &mut second).unwrap();

        assert!(matches!(
            chain.mine_block(&[first, second]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_spent_output_cannot_be_mined_again() {
        let (_dir, chain, mut wallets, from) = setup();
        let to = wallets.create_wallet().unwrap();
        let wallet = wallets.get_wallet(&from).unwrap().clone();

        let mut tx = chain.build_transaction(&from, &to, 10, &wallets).unwrap();
        chain.sign_transaction(&wallet, &mut tx).unwrap();
        chain.mine_and_append(&[tx.clone()]).unwrap();

        assert!(matches!(
            chain.mine_block(&[tx]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_build_transaction_errors() {
        let (_dir, chain, mut wallets, from) = setup();
        let to = wallets.create_wallet().unwrap();

        assert!(matches!(
            chain.build_transaction(&from, &to, 0, &wallets),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert!(matches!(
            chain.build_transaction(&from, "nope", 1, &wallets),
            Err(BlockchainError::InvalidAddress(_))
        ));

        // `from` is funded but its keys live elsewhere
        let empty = Wallets::load(tempdir().unwrap().path().join(WALLET_FILE), TEST_PASSPHRASE).unwrap();
        assert_eq!(
            chain.build_transaction(&from, &to, 1, &empty),
            Err(BlockchainError::UnknownWallet(from.clone()))
        );
    }

    #[test]
    fn test_find_transaction() {
        let (_dir, chain, _wallets, _address) = setup();
        let genesis = chain.get_tip_block().unwrap();
        let coinbase = &genesis.get_transactions()[0];

        assert_eq!(&chain.find_transaction(coinbase.get_id()).unwrap(), coinbase);
        assert_eq!(
            chain.find_transaction(&[0xab; 32]),
            Err(BlockchainError::UnknownTransaction("ab".repeat(32)))
        );
    }

    #[test]
    fn test_open_requires_existing_chain() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Blockchain::open(dir.path().join("db"), test_params()),
            Err(BlockchainError::Database(_))
        ));
    }

    #[test]
    fn test_spend_without_inputs_is_rejected() {
        let (_dir, chain, mut wallets, _address) = setup();
        let mallory = wallets.create_wallet().unwrap();
        let minted = forge(vec![], vec![(1_000_000, &mallory)]);

        assert!(!chain.verify_transaction(&minted).unwrap());
        assert!(matches!(
            chain.mine_and_append(&[minted]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(chain.get_best_height().unwrap(), 0);
        assert_eq!(chain.get_balance(&mallory).unwrap(), 0);
    }

    #[test]
    fn test_outputs_above_inputs_are_rejected() {
        let (_dir, chain, mut wallets, alice) = setup();
        let bob = wallets.create_wallet().unwrap();
        let wallet = wallets.get_wallet(&alice).unwrap().clone();

        let outputs = vec![TXOutput::new(10_000, &bob).unwrap()];
        let mut overspend =
            Transaction::new_spend(vec![genesis_input(&chain, &wallet)], outputs).unwrap();
        chain.sign_transaction(&wallet, &mut overspend).unwrap();

        assert!(chain.verify_transaction(&overspend).unwrap());
        assert!(matches!(
            chain.mine_block(&[overspend]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(chain.get_balance(&bob).unwrap(), 0);
    }

    #[test]
    fn test_negative_and_zero_outputs_are_rejected() {
        let (_dir, chain, mut wallets, alice) = setup();
        let bob = wallets.create_wallet().unwrap();
        let wallet = wallets.get_wallet(&alice).unwrap().clone();

        let cases = [
            vec![(-5, bob.as_str()), (55, alice.as_str())],
            vec![(0, bob.as_str()), (50, alice.as_str())],
        ];
        for outputs in cases {
            let mut tx = forge(vec![genesis_input(&chain, &wallet)], outputs);
            chain.sign_transaction(&wallet, &mut tx).unwrap();
            assert!(matches!(
                chain.mine_block(&[tx]),
                Err(BlockchainError::InvalidTransaction(_))
            ));
        }
    }

    #[test]
    fn test_overflowing_outputs_are_rejected() {
        let (_dir, chain, mut wallets, alice) = setup();
        let bob = wallets.create_wallet().unwrap();
        let wallet = wallets.get_wallet(&alice).unwrap().clone();

        let mut tx = forge(
            vec![genesis_input(&chain, &wallet)],
            vec![(i64::MAX, &bob), (i64::MAX, &bob), (2, &bob)],
        );
        chain.sign_transaction(&wallet, &mut tx).unwrap();
        assert!(matches!(
            chain.mine_block(&[tx]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_coinbase_rules() {
        let (_dir, chain, _wallets, address) = setup();
        let greedy = Transaction::new_coinbase_tx(&address, "", 51).unwrap();
        assert!(matches!(
            chain.mine_block(&[greedy]),
            Err(BlockchainError::InvalidTransaction(_))
        ));

        let first = Transaction::new_coinbase_tx(&address, "", 50).unwrap();
        let second = Transaction::new_coinbase_tx(&address, "", 50).unwrap();
        assert!(matches!(
            chain.mine_block(&[first, second]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_append_rejects_unsigned_spend() {
        let (_dir, chain, mut wallets, alice) = setup();
        let mallory = wallets.create_wallet().unwrap();
        let genesis = chain.get_tip_block().unwrap();

        let unsigned = chain.build_transaction(&alice, &mallory, 50, &wallets).unwrap();
        let block = seal_on(&genesis, &[unsigned], 1, &chain);

        assert!(matches!(
            chain.append_block(&block),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert!(!chain.block_exists(block.get_hash()).unwrap());
        assert_eq!(chain.get_tip_hash(), genesis.get_hash());

        chain.utxo_set().reindex().unwrap();
        assert_eq!(chain.get_balance(&mallory).unwrap(), 0);
        assert_eq!(chain.get_balance(&alice).unwrap(), 50);
    }

    #[test]
    fn test_append_rejects_spend_of_output_spent_on_its_chain() {
        let (_dir, chain, mut wallets, alice) = setup();
        let bob = wallets.create_wallet().unwrap();
        let wallet = wallets.get_wallet(&alice).unwrap().clone();

        let mut tx = chain.build_transaction(&alice, &bob, 10, &wallets).unwrap();
        chain.sign_transaction(&wallet, &mut tx).unwrap();
        let first = chain.mine_and_append(&[tx.clone()]).unwrap();

        let replay = seal_on(&first, &[tx], 2, &chain);
        assert!(matches!(
            chain.append_block(&replay),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(chain.get_tip_hash(), first.get_hash());
    }

    #[test]
    fn test_orphan_never_moves_tip() {
        let (_dir, chain, _wallets, address) = setup();
        let tip = chain.get_tip_hash();
        let coinbase = Transaction::new_coinbase_tx(&address, "", 50).unwrap();
        let orphan = Block::seal(
            &[7u8; 32],
            &[coinbase],
            u32::MAX,
            chain.get_pow(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(chain.append_block(&orphan).unwrap(), BlockStatus::Orphan);
        assert_eq!(chain.append_block(&orphan).unwrap(), BlockStatus::AlreadyKnown);
        assert_eq!(chain.get_tip_hash(), tip);
        assert!(!chain.block_exists(orphan.get_hash()).unwrap());
        assert_eq!(chain.get_block_hashes().unwrap().len(), 1);

        let next = chain.mine_and_append(&[]).unwrap();
        assert_eq!(next.get_height(), 1);
    }

    #[test]
    fn test_orphans_connect_when_parent_arrives() {
        let (_dir, chain, _wallets, address) = setup();
        let genesis = chain.get_tip_block().unwrap();
        let first = seal_on(
            &genesis,
            &[Transaction::new_coinbase_tx(&address, "", 50).unwrap()],
            1,
            &chain,
        );
        let second = seal_on(
            &first,
            &[Transaction::new_coinbase_tx(&address, "", 50).unwrap()],
            2,
            &chain,
        );

        assert_eq!(chain.append_block(&second).unwrap(), BlockStatus::Orphan);
        assert_eq!(chain.get_best_height().unwrap(), 0);

        assert_eq!(chain.append_block(&first).unwrap(), BlockStatus::NewTip);
        assert_eq!(chain.get_tip_hash(), second.get_hash());
        assert_eq!(chain.get_best_height().unwrap(), 2);
        assert_eq!(chain.append_block(&second).unwrap(), BlockStatus::AlreadyKnown);
    }

    #[test]
    fn test_invalid_orphan_is_dropped_when_parent_arrives() {
        let (_dir, chain, mut wallets, alice) = setup();
        let mallory = wallets.create_wallet().unwrap();
        let genesis = chain.get_tip_block().unwrap();
        let first = seal_on(
            &genesis,
            &[Transaction::new_coinbase_tx(&alice, "", 50).unwrap()],
            1,
            &chain,
        );
        let unsigned = chain.build_transaction(&alice, &mallory, 50, &wallets).unwrap();
        let bad_child = seal_on(&first, &[unsigned], 2, &chain);

        assert_eq!(chain.append_block(&bad_child).unwrap(), BlockStatus::Orphan);
        assert_eq!(chain.append_block(&first).unwrap(), BlockStatus::NewTip);

        assert_eq!(chain.get_tip_hash(), first.get_hash());
        assert!(!chain.block_exists(bad_child.get_hash()).unwrap());
        assert!(matches!(
            chain.append_block(&bad_child),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_stale_mined_block_leaves_index_alone() {
        let (_dir, chain, mut wallets, alice) = setup();
        let bob = wallets.create_wallet().unwrap();
        let wallet = wallets.get_wallet(&alice).unwrap().clone();

        let mut tx = chain.build_transaction(&alice, &bob, 10, &wallets).unwrap();
        chain.sign_transaction(&wallet, &mut tx).unwrap();
        let ours = chain.mine_block(&[tx]).unwrap();

        // a competing block takes the tip before ours is committed
        let theirs = chain
            .mine_block(&[Transaction::new_coinbase_tx(&bob, "", 50).unwrap()])
            .unwrap();
        assert_eq!(chain.append_block(&theirs).unwrap(), BlockStatus::NewTip);

        assert!(matches!(
            chain.commit_mined_block(ours.clone()),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert!(chain.block_exists(ours.get_hash()).unwrap());
        assert_eq!(chain.get_balance(&alice).unwrap(), 50);
        assert_eq!(chain.get_balance(&bob).unwrap(), 0);
    }

    #[test]
    fn test_cached_tip_matches_stored_tip_under_concurrency() {
        let (_dir, chain, _wallets, address) = setup();
        let mut parent = chain.get_tip_block().unwrap();
        let mut blocks = vec![];
        for height in 1..=6 {
            let coinbase = Transaction::new_coinbase_tx(&address, "", 50).unwrap();
            let block = seal_on(&parent, &[coinbase], height, &chain);
            blocks.push(block.clone());
            parent = block;
        }

        let handles: Vec<_> = blocks
            .iter()
            .rev()
            .cloned()
            .map(|block| {
                let chain = chain.clone();
                thread::spawn(move || chain.append_block(&block).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored_tip = chain
            .blocks_tree()
            .unwrap()
            .get(TIP_BLOCK_HASH_KEY)
            .unwrap()
            .unwrap()
            .to_vec();
        assert_eq!(chain.get_tip_hash(), stored_tip);
        assert_eq!(chain.get_tip_hash(), parent.get_hash());
        assert_eq!(chain.get_best_height().unwrap(), 6);
    }
}
