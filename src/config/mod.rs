//! Configuration management
//!
//! Node addresses, seed peers, storage locations and chain parameters, read
//! from an optional TOML file and the environment.

pub mod settings;

pub use settings::{Config, CONFIG_PATH_KEY, DEFAULT_CONFIG_FILE};
