//! Configuration management for powchain

use crate::error::ChainError;
use crate::pow::{DEFAULT_DIFFICULTY_BITS, MAX_DIFFICULTY_BITS};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// File read when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub mining: MiningConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WalletConfig {
    #[serde(default = "default_wallet_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MiningConfig {
    #[serde(default = "default_difficulty_bits")]
    pub difficulty_bits: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            path: default_wallet_path(),
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            difficulty_bits: default_difficulty_bits(),
            threads: default_threads(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("blockchain.db")
}

fn default_wallet_path() -> PathBuf {
    PathBuf::from("wallet.json")
}

fn default_difficulty_bits() -> u64 {
    DEFAULT_DIFFICULTY_BITS
}

fn default_threads() -> usize {
    1
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| ChainError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ChainError::ConfigError(
                "database.path must not be empty".to_string(),
            ));
        }
        if self.wallet.path.as_os_str().is_empty() {
            return Err(ChainError::ConfigError(
                "wallet.path must not be empty".to_string(),
            ));
        }
        if self.mining.difficulty_bits == 0 || self.mining.difficulty_bits > MAX_DIFFICULTY_BITS {
            return Err(ChainError::ConfigError(format!(
                "mining.difficulty_bits must be between 1 and {}, got {}",
                MAX_DIFFICULTY_BITS, self.mining.difficulty_bits
            )));
        }
        if self.mining.threads == 0 {
            return Err(ChainError::ConfigError(
                "mining.threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads `path`, or `config.toml` when `path` is `None`. A missing default
/// file yields the defaults; a missing explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, ChainError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    if !path.exists() {
        if explicit {
            return Err(ChainError::ConfigError(format!(
                "Config file {} not found",
                path.display()
            )));
        }
        tracing::debug!("No {} found, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(&path).map_err(|e| {
        ChainError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Config::from_toml(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.path, PathBuf::from("blockchain.db"));
        assert_eq!(config.wallet.path, PathBuf::from("wallet.json"));
        assert_eq!(config.mining.difficulty_bits, 16);
        assert_eq!(config.mining.threads, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::from_toml("[mining]\ndifficulty_bits = 20\n").unwrap();
        assert_eq!(config.mining.difficulty_bits, 20);
        assert_eq!(config.mining.threads, 1);
        assert_eq!(config.database.path, PathBuf::from("blockchain.db"));
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        for bad in [
            "[mining]\ndifficulty_bits = 0\n",
            "[mining]\ndifficulty_bits = 300\n",
            "[mining]\nthreads = 0\n",
            "[database]\npath = \"\"\n",
            "[wallet]\npath = \"\"\n",
            "not toml at all [",
        ] {
            assert!(
                matches!(Config::from_toml(bad), Err(ChainError::ConfigError(_))),
                "accepted: {}",
                bad
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("powchain.toml");
        fs::write(
            &path,
            "[database]\npath = \"chain.db\"\n[mining]\nthreads = 4\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.database.path, PathBuf::from("chain.db"));
        assert_eq!(config.mining.threads, 4);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            load_config(Some(&missing)),
            Err(ChainError::ConfigError(_))
        ));
    }
}
