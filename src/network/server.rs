use crate::core::{Block, BlockStatus, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    BlockPayload, GetBlocksPayload, GetDataPayload, InvPayload, OpType, Package, TxPayload,
    VersionPayload, NODE_VERSION,
};
use crate::network::Nodes;
use crate::storage::{BlockInTransit, MemoryPool};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address peers use to reach this node; also the `addr_from` it sends.
    pub node_addr: String,
    /// Initial peers; the first one is the root node.
    pub seed_nodes: Vec<String>,
    /// Reward address; a node without one never mines.
    pub mining_addr: Option<String>,
    /// Verified mempool transactions needed before mining starts.
    pub mempool_batch_size: usize,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub max_message_size: u64,
}

impl ServerConfig {
    pub fn new(node_addr: &str, seed_nodes: Vec<String>) -> ServerConfig {
        ServerConfig {
            node_addr: node_addr.to_string(),
            seed_nodes,
            mining_addr: None,
            mempool_batch_size: 2,
            read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(5000),
            max_connections: 32,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A peer node: one accept loop, one thread per inbound message.
#[derive(Clone)]
pub struct Server {
    blockchain: Blockchain,
    config: Arc<ServerConfig>,
    nodes: Arc<Nodes>,
    memory_pool: Arc<MemoryPool>,
    blocks_in_transit: Arc<BlockInTransit>,
    mining: Arc<AtomicBool>,
    cancel_mining: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
}

// Releases a connection slot when the handler thread ends
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Server {
    pub fn new(blockchain: Blockchain, config: ServerConfig) -> Server {
        let nodes = Nodes::with_seeds(&config.seed_nodes);
        Server {
            blockchain,
            config: Arc::new(config),
            nodes: Arc::new(nodes),
            memory_pool: Arc::new(MemoryPool::new()),
            blocks_in_transit: Arc::new(BlockInTransit::new()),
            mining: Arc::new(AtomicBool::new(false)),
            cancel_mining: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn get_nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn get_memory_pool(&self) -> &MemoryPool {
        &self.memory_pool
    }

    pub fn node_addr(&self) -> &str {
        &self.config.node_addr
    }

    fn root_addr(&self) -> Option<&str> {
        self.config.seed_nodes.first().map(String::as_str)
    }

    fn is_root(&self) -> bool {
        self.root_addr() == Some(self.node_addr())
    }

    /// Binds `node_addr` and serves until the listener fails.
    pub fn run(&self) -> Result<()> {
        let addr = self.node_addr();
        let listener = TcpListener::bind(addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        self.serve(listener)
    }

    /// Serves connections from an already bound listener.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Server listening on {}", self.node_addr());

        if !self.is_root() {
            if let Some(root) = self.root_addr() {
                self.send_version(root)?;
            }
        }

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Error accepting connection: {e}");
                    continue;
                }
            };

            let active = self.active_connections.fetch_add(1, Ordering::SeqCst);
            let slot = ConnectionSlot(Arc::clone(&self.active_connections));
            if active >= self.config.max_connections {
                warn!(
                    "Rejecting connection: limit of {} reached",
                    self.config.max_connections
                );
                continue;
            }

            let server = self.clone();
            thread::spawn(move || {
                let _slot = slot;
                if let Err(e) = server.handle_connection(stream) {
                    error!("Error handling connection: {e}");
                }
            });
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let mut buf = Vec::new();
        (&stream)
            .take(self.config.max_message_size + 1)
            .read_to_end(&mut buf)
            .map_err(|e| BlockchainError::Network(format!("Failed to read message: {e}")))?;
        let _ = stream.shutdown(Shutdown::Both);

        if buf.len() as u64 > self.config.max_message_size {
            return Err(BlockchainError::Network(format!(
                "message exceeds {} bytes",
                self.config.max_message_size
            )));
        }

        let pkg = Package::from_bytes(&buf)?;
        info!("Received {} command from {}", pkg.command(), pkg.addr_from());
        self.process_message(pkg)
    }

    pub(crate) fn process_message(&self, pkg: Package) -> Result<()> {
        match pkg {
            Package::Version(p) => self.handle_version(&p.addr_from, p.best_height),
            Package::GetBlocks(p) => self.handle_get_blocks(&p.addr_from),
            Package::Inv(p) => self.handle_inv(&p.addr_from, p.op_type, &p.items),
            Package::GetData(p) => self.handle_get_data(&p.addr_from, p.op_type, &p.id),
            Package::Block(p) => self.handle_block(&p.addr_from, &p.block),
            Package::Tx(p) => self.handle_tx(&p.addr_from, &p.transaction),
        }
    }

    fn handle_version(&self, addr_from: &str, best_height: u32) -> Result<()> {
        let local_best_height = self.blockchain.get_best_height()?;
        debug!("Peer {addr_from} has height {best_height}, local height {local_best_height}");

        if local_best_height < best_height {
            self.send_get_blocks(addr_from)?;
        } else if local_best_height > best_height {
            self.send_version(addr_from)?;
        }

        if self.nodes.add_node(addr_from) {
            info!("Registered peer {addr_from}");
        }
        Ok(())
    }

    fn handle_get_blocks(&self, addr_from: &str) -> Result<()> {
        let blocks = self.blockchain.get_block_hashes()?;
        self.send_inv(addr_from, OpType::Block, &blocks)
    }

    fn handle_inv(&self, addr_from: &str, op_type: OpType, items: &[Vec<u8>]) -> Result<()> {
        info!("Received inventory with {} {op_type:?} item(s)", items.len());
        match op_type {
            OpType::Block => {
                // inventories list tip first; fetch oldest first so parents
                // are stored before their children arrive
                let mut missing = Vec::with_capacity(items.len());
                for hash in items.iter().rev() {
                    if !self.blockchain.block_exists(hash)? {
                        missing.push(hash.clone());
                    }
                }
                self.blocks_in_transit.set_blocks(&missing);
                if let Some(block_hash) = missing.first() {
                    self.send_get_data(addr_from, OpType::Block, block_hash)?;
                    self.blocks_in_transit.remove(block_hash);
                }
            }
            OpType::Tx => {
                if let Some(txid) = items.first() {
                    if !self.memory_pool.contains(&HEXLOWER.encode(txid)) {
                        self.send_get_data(addr_from, OpType::Tx, txid)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_get_data(&self, addr_from: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        match op_type {
            OpType::Block => match self.blockchain.get_block(id)? {
                Some(block) => self.send_block(addr_from, &block)?,
                None => debug!("Block {} not found", HEXLOWER.encode(id)),
            },
            OpType::Tx => match self.memory_pool.get(&HEXLOWER.encode(id)) {
                Some(tx) => self.send_tx(addr_from, &tx)?,
                None => debug!("Transaction {} not in mempool", HEXLOWER.encode(id)),
            },
        }
        Ok(())
    }

    fn handle_block(&self, addr_from: &str, block_data: &[u8]) -> Result<()> {
        let block = Block::deserialize(block_data)?;
        let status = self.blockchain.append_block(&block)?;
        info!(
            "Added block {} from {addr_from} ({status:?})",
            block.get_hash_hex()
        );

        match status {
            BlockStatus::NewTip => {
                // a stale nonce search would only produce a side block
                self.cancel_mining.store(true, Ordering::SeqCst);
                self.memory_pool.remove_all(block.get_transactions());
            }
            BlockStatus::Orphan if self.blocks_in_transit.is_empty() => {
                return self.send_get_blocks(addr_from);
            }
            _ => {}
        }

        if let Some(block_hash) = self.blocks_in_transit.first() {
            self.send_get_data(addr_from, OpType::Block, &block_hash)?;
            self.blocks_in_transit.remove(&block_hash);
        } else {
            self.blockchain.utxo_set().reindex()?;
        }
        Ok(())
    }

    fn handle_tx(&self, addr_from: &str, transaction_data: &[u8]) -> Result<()> {
        let tx = Transaction::deserialize(transaction_data)?;
        let txid = tx.get_id().to_vec();
        self.memory_pool.add(tx);
        info!(
            "Transaction {} added to mempool ({} pending)",
            HEXLOWER.encode(&txid),
            self.memory_pool.len()
        );

        if self.is_root() {
            for node in self.nodes.get_nodes() {
                if node != self.node_addr() && node != addr_from {
                    self.send_inv(&node, OpType::Tx, std::slice::from_ref(&txid))?;
                }
            }
            return Ok(());
        }

        if let Some(mining_addr) = self.config.mining_addr.as_deref() {
            self.mine_pending(mining_addr)?;
        }
        Ok(())
    }

    // Only one thread runs the mining loop; others just leave their
    // transaction in the pool for it to pick up.
    fn mine_pending(&self, mining_addr: &str) -> Result<()> {
        loop {
            if self
                .mining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Ok(());
            }
            let result = self.mine_while_pending(mining_addr);
            self.mining.store(false, Ordering::SeqCst);
            result?;

            // a transaction may have landed after the last check
            if self.mineable_transactions()?.len() < self.config.mempool_batch_size {
                return Ok(());
            }
        }
    }

    fn mine_while_pending(&self, mining_addr: &str) -> Result<()> {
        loop {
            let mut txs = self.mineable_transactions()?;
            if txs.len() < self.config.mempool_batch_size {
                return Ok(());
            }

            let coinbase = Transaction::new_coinbase_tx(
                mining_addr,
                "",
                self.blockchain.get_params().block_reward,
            )?;
            txs.push(coinbase);

            self.cancel_mining.store(false, Ordering::SeqCst);
            let new_block = match self
                .blockchain
                .mine_block_with_cancel(&txs, &self.cancel_mining)
            {
                Ok(block) => block,
                Err(BlockchainError::MiningCancelled) => {
                    info!("A new tip arrived while mining; starting over");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.blockchain.append_block(&new_block)? != BlockStatus::NewTip {
                warn!(
                    "Mined block {} did not become the tip",
                    new_block.get_hash_hex()
                );
                continue;
            }
            self.blockchain.utxo_set().reindex()?;
            self.memory_pool.remove_all(&txs);
            info!("New block {} is mined!", new_block.get_hash_hex());

            for node in self.nodes.get_nodes() {
                if node != self.node_addr() {
                    self.send_inv(&node, OpType::Block, &[new_block.get_hash().to_vec()])?;
                }
            }
        }
    }

    // Pooled transactions that would be valid in the next block and spend
    // distinct outputs. Ones that can never be mined are dropped from the pool.
    fn mineable_transactions(&self) -> Result<Vec<Transaction>> {
        let mut claimed: HashSet<(Vec<u8>, i32)> = HashSet::new();
        let mut selected = vec![];

        for tx in self.memory_pool.get_all() {
            if tx.is_coinbase() {
                warn!("Dropping relayed coinbase {}", tx.get_id_hex());
                self.memory_pool.remove(&tx.get_id_hex());
                continue;
            }
            match self
                .blockchain
                .validate_transactions(std::slice::from_ref(&tx))
            {
                Ok(()) => {}
                Err(BlockchainError::UnknownTransaction(txid)) => {
                    debug!(
                        "Transaction {} waits for unknown transaction {txid}",
                        tx.get_id_hex()
                    );
                    continue;
                }
                Err(BlockchainError::InvalidTransaction(reason)) => {
                    warn!("Dropping invalid transaction: {reason}");
                    self.memory_pool.remove(&tx.get_id_hex());
                    continue;
                }
                Err(e) => return Err(e),
            }

            let refs: Vec<(Vec<u8>, i32)> = tx
                .get_vin()
                .iter()
                .map(|vin| (vin.get_prev_txid().to_vec(), vin.get_prev_output_index()))
                .collect();
            if refs.iter().any(|r| claimed.contains(r)) {
                continue;
            }
            claimed.extend(refs);
            selected.push(tx);
        }
        Ok(selected)
    }

    fn send_version(&self, addr: &str) -> Result<()> {
        let best_height = self.blockchain.get_best_height()?;
        self.send_data(
            addr,
            Package::Version(VersionPayload {
                addr_from: self.node_addr().to_string(),
                version: NODE_VERSION,
                best_height,
            }),
        )
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        self.send_data(
            addr,
            Package::GetBlocks(GetBlocksPayload {
                addr_from: self.node_addr().to_string(),
            }),
        )
    }

    fn send_get_data(&self, addr: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        self.send_data(
            addr,
            Package::GetData(GetDataPayload {
                addr_from: self.node_addr().to_string(),
                op_type,
                id: id.to_vec(),
            }),
        )
    }

    fn send_inv(&self, addr: &str, op_type: OpType, items: &[Vec<u8>]) -> Result<()> {
        self.send_data(
            addr,
            Package::Inv(InvPayload {
                addr_from: self.node_addr().to_string(),
                op_type,
                items: items.to_vec(),
            }),
        )
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        self.send_data(
            addr,
            Package::Block(BlockPayload {
                addr_from: self.node_addr().to_string(),
                block: block.serialize()?,
            }),
        )
    }

    fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<()> {
        self.send_data(
            addr,
            Package::Tx(TxPayload {
                addr_from: self.node_addr().to_string(),
                transaction: tx.serialize()?,
            }),
        )
    }

    // An unreachable peer is forgotten rather than reported as an error
    fn send_data(&self, addr: &str, pkg: Package) -> Result<()> {
        debug!("Sending {} to {addr}", pkg.command());
        match send_package(addr, &pkg, self.config.connect_timeout) {
            Ok(()) => Ok(()),
            Err(BlockchainError::Network(e)) => {
                warn!("Peer {addr} is not available, removing it: {e}");
                self.nodes.evict_node(addr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Delivers one message over a fresh connection and closes the write side.
pub fn send_package(addr: &str, pkg: &Package, connect_timeout: Duration) -> Result<()> {
    let bytes = pkg.to_bytes()?;
    let socket_addrs = addr
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?;

    let mut last_error = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect_timeout(&socket_addr, connect_timeout) {
            Ok(mut stream) => {
                stream
                    .set_write_timeout(Some(connect_timeout))
                    .map_err(|e| {
                        BlockchainError::Network(format!("Failed to set write timeout: {e}"))
                    })?;
                stream
                    .write_all(&bytes)
                    .map_err(|e| BlockchainError::Network(format!("Failed to send data: {e}")))?;
                let _ = stream.shutdown(Shutdown::Write);
                return Ok(());
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(BlockchainError::Network(match last_error {
        Some(e) => format!("Failed to connect to {addr}: {e}"),
        None => format!("{addr} did not resolve to any address"),
    }))
}

/// Hands a signed transaction to a node, as a wallet client does.
pub fn send_tx(
    addr: &str,
    addr_from: &str,
    tx: &Transaction,
    connect_timeout: Duration,
) -> Result<()> {
    let pkg = Package::Tx(TxPayload {
        addr_from: addr_from.to_string(),
        transaction: tx.serialize()?,
    });
    send_package(addr, &pkg, connect_timeout)
}
