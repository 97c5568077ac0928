//! Peer-to-peer networking
//!
//! The command-tagged wire format, the known-peer registry and the node
//! server that syncs blocks, relays transactions and mines.

pub mod message;
pub mod node;
pub mod server;

pub use message::{OpType, Package, COMMAND_LENGTH, NODE_VERSION};
pub use node::Nodes;
pub use server::{send_package, send_tx, Server, ServerConfig};
