//! Node configuration for the Tessera full node.
//!
//! [`NodeConfig`] composes the chain and sync settings with the data
//! directory, logging and networking. [`NodeConfig::load`] layers built-in
//! defaults, an optional TOML file and `TESSERA_`-prefixed environment
//! variables (nested keys use `__`, e.g. `TESSERA_SYNC__MAX_LIVE_PEERS`).

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use tessera_chain::ChainConfig;
use tessera_core::error::TesseraError;
use tessera_sync::SyncConfig;

/// Default P2P listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:7370";

/// Configuration for a full node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    pub chain: ChainConfig,
    pub sync: SyncConfig,
    /// Log level filter string (e.g. "info", "debug", "tessera_sync=trace").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
    /// TCP address to accept peers on.
    pub listen: String,
    /// Bootstrap peers dialed at startup (`host:port`).
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tessera");

        Self {
            data_dir,
            chain: ChainConfig::default(),
            sync: SyncConfig::default(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            listen: DEFAULT_LISTEN.to_string(),
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load defaults, then `path` (TOML) if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, TesseraError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        Self::from_builder(builder)
    }

    /// Like [`load`](Self::load) but reading TOML from a string.
    pub fn from_toml(toml: &str) -> Result<Self, TesseraError> {
        Self::from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, TesseraError> {
        let full = builder
            .add_source(
                Environment::with_prefix("TESSERA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("peers"),
            )
            .build()
            .map_err(|e| TesseraError::Config(e.to_string()))?;
        full.try_deserialize()
            .map_err(|e| TesseraError::Config(e.to_string()))
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }
}
