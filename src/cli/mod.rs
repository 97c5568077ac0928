//! Command-line interface
//!
//! Argument parsing for the `powchain` binary.

pub mod commands;

pub use commands::{ChainCommand, Command, NodeCommand, Opt, WalletCommand};
