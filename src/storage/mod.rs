//! Data storage and persistence
//!
//! The sled-backed unspent-output index and the in-memory pools a node keeps
//! while syncing and mining.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use utxo_set::{UTXOSet, UnspentOutput};
