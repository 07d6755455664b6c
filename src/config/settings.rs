use crate::error::{BlockchainError, Result};
use crate::network::ServerConfig;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const NODE_ID_KEY: &str = "NODE_ID";
const CONFIG_PATH_KEY: &str = "MINICOIN_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "minicoin.toml";

/// Settings that may come from the optional TOML file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub host: String,
    pub bootstrap_node: String,
    pub read_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("./data"),
            host: "localhost".to_string(),
            bootstrap_node: "localhost:3000".to_string(),
            read_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Settings> {
        Ok(toml::from_str(content)?)
    }

    /// Reads `path`, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    BlockchainError::Config(format!("Cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&content)
            }
            None => Ok(Settings::default()),
        }
    }
}

/// Configuration of one node identity
#[derive(Debug, Clone)]
pub struct Config {
    node_id: String,
    settings: Settings,
}

impl Config {
    pub fn new(node_id: &str, settings: Settings) -> Result<Config> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(BlockchainError::Config(
                "NODE_ID must not be empty".to_string(),
            ));
        }
        Ok(Config {
            node_id: node_id.to_string(),
            settings,
        })
    }

    /// Builds the configuration from `NODE_ID` and the settings file named by
    /// `MINICOIN_CONFIG`, falling back to `./minicoin.toml` when it exists
    pub fn from_env() -> Result<Config> {
        let node_id = env::var(NODE_ID_KEY)
            .map_err(|_| BlockchainError::Config("NODE_ID env var is not set".to_string()))?;

        let config_path = match env::var(CONFIG_PATH_KEY) {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            }
        };

        Self::new(&node_id, Settings::load(config_path.as_deref())?)
    }

    pub fn get_node_id(&self) -> &str {
        self.node_id.as_str()
    }

    pub fn get_settings(&self) -> &Settings {
        &self.settings
    }

    pub fn node_addr(&self) -> String {
        format!("{}:{}", self.settings.host, self.node_id)
    }

    pub fn bootstrap_addr(&self) -> &str {
        self.settings.bootstrap_node.as_str()
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.settings
            .data_dir
            .join(format!("blockchain_{}", self.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.settings
            .data_dir
            .join(format!("wallet_{}.dat", self.node_id))
    }

    pub fn server_config(&self, miner_address: Option<String>) -> ServerConfig {
        ServerConfig::new(&self.node_addr(), self.bootstrap_addr())
            .with_miner(miner_address)
            .with_read_timeout(Duration::from_secs(self.settings.read_timeout_secs))
    }
}
