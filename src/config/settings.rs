use crate::core::{ChainParams, DEFAULT_BLOCK_REWARD, DEFAULT_DIFFICULTY, DEFAULT_GENESIS_DATA};
use crate::error::{BlockchainError, Result};
use crate::network::server::DEFAULT_MAX_MESSAGE_SIZE;
use crate::network::ServerConfig;
use crate::wallet::WALLET_FILE;
use log::debug;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_PATH_KEY: &str = "POWCHAIN_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "powchain.toml";

const NODE_HOST_KEY: &str = "NODE_HOST";
const SEED_NODES_KEY: &str = "SEED_NODES";
const DATA_DIR_KEY: &str = "DATA_DIR";
const BLOCK_REWARD_KEY: &str = "BLOCK_REWARD";
const GENESIS_DATA_KEY: &str = "GENESIS_DATA";
const DIFFICULTY_KEY: &str = "DIFFICULTY";
const MEMPOOL_BATCH_SIZE_KEY: &str = "MEMPOOL_BATCH_SIZE";
const MAX_CONNECTIONS_KEY: &str = "MAX_CONNECTIONS";
const WALLET_PASSPHRASE_KEY: &str = "WALLET_PASSPHRASE";

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_host: String,
    pub seed_nodes: Vec<String>,
    pub data_dir: PathBuf,
    pub block_reward: i64,
    pub genesis_data: String,
    pub difficulty: usize,
    pub mempool_batch_size: usize,
    pub read_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub max_connections: usize,
    /// Unlocks the wallet file; usually supplied through `WALLET_PASSPHRASE`.
    pub wallet_passphrase: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_host: "localhost".to_string(),
            seed_nodes: vec!["localhost:3000".to_string()],
            data_dir: PathBuf::from("data"),
            block_reward: DEFAULT_BLOCK_REWARD,
            genesis_data: DEFAULT_GENESIS_DATA.to_string(),
            difficulty: DEFAULT_DIFFICULTY,
            mempool_batch_size: 2,
            read_timeout_secs: 30,
            connect_timeout_ms: 5000,
            max_connections: 32,
            wallet_passphrase: String::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("node_host", &self.node_host)
            .field("seed_nodes", &self.seed_nodes)
            .field("data_dir", &self.data_dir)
            .field("block_reward", &self.block_reward)
            .field("difficulty", &self.difficulty)
            .field("mempool_batch_size", &self.mempool_batch_size)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Defaults, then the TOML file named by `POWCHAIN_CONFIG` (or
    /// `powchain.toml` when present), then environment overrides.
    pub fn load() -> Result<Config> {
        let mut config = match env::var(CONFIG_PATH_KEY) {
            Ok(path) => Config::from_file(path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Config::from_file(DEFAULT_CONFIG_FILE)?
            }
            Err(_) => Config::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Could not read {}: {e}", path.display()))
        })?;
        Config::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Config> {
        toml::from_str(contents)
            .map_err(|e| BlockchainError::Config(format!("Invalid configuration: {e}")))
    }

    /// Overrides fields from `lookup(key)`; split out so tests need not touch
    /// the process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup(NODE_HOST_KEY) {
            self.node_host = host;
        }
        if let Some(seeds) = lookup(SEED_NODES_KEY) {
            self.seed_nodes = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(dir) = lookup(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(genesis_data) = lookup(GENESIS_DATA_KEY) {
            self.genesis_data = genesis_data;
        }
        if let Some(value) = lookup(BLOCK_REWARD_KEY) {
            self.block_reward = parse_var(BLOCK_REWARD_KEY, &value)?;
        }
        if let Some(value) = lookup(DIFFICULTY_KEY) {
            self.difficulty = parse_var(DIFFICULTY_KEY, &value)?;
        }
        if let Some(value) = lookup(MEMPOOL_BATCH_SIZE_KEY) {
            self.mempool_batch_size = parse_var(MEMPOOL_BATCH_SIZE_KEY, &value)?;
        }
        if let Some(value) = lookup(MAX_CONNECTIONS_KEY) {
            self.max_connections = parse_var(MAX_CONNECTIONS_KEY, &value)?;
        }
        if let Some(passphrase) = lookup(WALLET_PASSPHRASE_KEY) {
            self.wallet_passphrase = passphrase;
        }
        Ok(())
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            difficulty: self.difficulty,
            block_reward: self.block_reward,
            genesis_data: self.genesis_data.clone(),
        }
    }

    /// Each node id gets its own database so several nodes can share a host.
    pub fn db_path(&self, node_id: &str) -> PathBuf {
        self.data_dir.join(format!("blocks_{node_id}"))
    }

    pub fn wallet_file(&self, node_id: &str) -> PathBuf {
        self.data_dir.join(format!("{node_id}_{WALLET_FILE}"))
    }

    pub fn node_addr(&self, port: u16) -> String {
        format!("{}:{port}", self.node_host)
    }

    pub fn root_node(&self) -> Option<&str> {
        self.seed_nodes.first().map(String::as_str)
    }

    pub fn server_config(&self, port: u16, mining_addr: Option<String>) -> ServerConfig {
        ServerConfig {
            node_addr: self.node_addr(port),
            seed_nodes: self.seed_nodes.clone(),
            mining_addr,
            mempool_batch_size: self.mempool_batch_size,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            connect_timeout: self.connect_timeout(),
            max_connections: self.max_connections,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BlockchainError::Config(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.root_node(), Some("localhost:3000"));
        assert_eq!(config.block_reward, 50);
        assert_eq!(config.difficulty, 4);
        assert_eq!(config.node_addr(3001), "localhost:3001");
        assert_eq!(config.db_path("3001"), PathBuf::from("data").join("blocks_3001"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            difficulty = 2
            seed_nodes = ["10.0.0.1:3000", "10.0.0.2:3000"]
            "#,
        )
        .unwrap();

        assert_eq!(config.difficulty, 2);
        assert_eq!(config.seed_nodes.len(), 2);
        assert_eq!(config.node_host, "localhost");
        assert_eq!(config.chain_params().block_reward, 50);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            Config::from_toml("difficulty = \"hard\""),
            Err(BlockchainError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NODE_HOST", "127.0.0.1"),
            ("SEED_NODES", "127.0.0.1:4000, 127.0.0.1:4001"),
            ("DIFFICULTY", "3"),
            ("MEMPOOL_BATCH_SIZE", "1"),
            ("WALLET_PASSPHRASE", "open sesame"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node_addr(4002), "127.0.0.1:4002");
        assert_eq!(config.seed_nodes, vec!["127.0.0.1:4000", "127.0.0.1:4001"]);
        assert_eq!(config.difficulty, 3);
        assert_eq!(config.server_config(4002, None).mempool_batch_size, 1);
        assert_eq!(config.wallet_passphrase, "open sesame");
        assert!(!format!("{config:?}").contains("open sesame"));
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| {
            (key == "BLOCK_REWARD").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(BlockchainError::Config(_))));
    }
}
