//! Key store mapping addresses to secp256k1 key pairs.
//!
//! Wallets are kept in a JSON file written atomically (temp file + rename),
//! with the previous version preserved as a `.backup` copy.

use crate::address;
use crate::crypto::KeyPair;
use crate::error::ChainError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BACKUP_SUFFIX: &str = ".backup";

/// Lookup contract the ledger needs from a key store.
pub trait KeyStore {
    fn lookup(&self, address: &str) -> Option<KeyPair>;
    fn create(&self) -> Result<(String, KeyPair), ChainError>;
    fn list_addresses(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletEntry {
    pub secret_key_hex: String,
    /// RFC3339 timestamp when the key pair was generated
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WalletsInner {
    entries: BTreeMap<String, WalletEntry>,
}

/// Thread-safe collection of key pairs, optionally backed by a file.
#[derive(Debug, Clone, Default)]
pub struct Wallets {
    inner: Arc<RwLock<WalletsInner>>,
    path: Option<PathBuf>,
}

impl Wallets {
    /// A key store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the key store at `path`, starting empty if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let inner = if path.exists() {
            let contents = fs::read_to_string(path)
                .map_err(|e| ChainError::WalletError(format!("Failed to read wallets: {}", e)))?;
            let inner: WalletsInner = serde_json::from_str(&contents)
                .map_err(|e| ChainError::WalletError(format!("Failed to parse wallets: {}", e)))?;
            for (addr, entry) in &inner.entries {
                address::decode(addr)?;
                let secret = hex::decode(&entry.secret_key_hex).map_err(|e| {
                    ChainError::WalletError(format!("Bad secret key for {}: {}", addr, e))
                })?;
                KeyPair::from_secret_bytes(&secret)?;
            }
            inner
        } else {
            tracing::debug!("No wallet file at {}, starting empty", path.display());
            WalletsInner::default()
        };

        Ok(Wallets {
            inner: Arc::new(RwLock::new(inner)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Saves to the backing file, if any.
    pub fn save(&self) -> Result<(), ChainError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self.inner.read();

        if path.exists() {
            let backup_path = path.with_extension(format!("json{}", BACKUP_SUFFIX));
            fs::copy(path, &backup_path)
                .map_err(|e| ChainError::WalletError(format!("Failed to create backup: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(&*inner)
            .map_err(|e| ChainError::WalletError(format!("Failed to serialize wallets: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .map_err(|e| ChainError::WalletError(format!("Failed to create temp file: {}", e)))?;
        file.write_all(json.as_bytes())
            .map_err(|e| ChainError::WalletError(format!("Failed to write wallets: {}", e)))?;
        file.sync_all()
            .map_err(|e| ChainError::WalletError(format!("Failed to sync file: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, path)
            .map_err(|e| ChainError::WalletError(format!("Failed to finalize write: {}", e)))?;
        Ok(())
    }

    /// Generates a key pair, stores it and persists the store.
    pub fn create_wallet(&self) -> Result<String, ChainError> {
        let (address, _) = self.create()?;
        Ok(address)
    }

    /// Registers an existing key pair, returning its address.
    pub fn insert(&self, keypair: &KeyPair) -> String {
        let addr = address::encode(&keypair.pub_key_hash());
        let entry = WalletEntry {
            secret_key_hex: hex::encode(keypair.secret_bytes()),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.inner.write().entries.insert(addr.clone(), entry);
        addr
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyStore for Wallets {
    fn lookup(&self, address: &str) -> Option<KeyPair> {
        let inner = self.inner.read();
        let entry = inner.entries.get(address)?;
        let secret = hex::decode(&entry.secret_key_hex).ok()?;
        KeyPair::from_secret_bytes(&secret).ok()
    }

    fn create(&self) -> Result<(String, KeyPair), ChainError> {
        let keypair = KeyPair::generate();
        let addr = self.insert(&keypair);
        if let Err(e) = self.save() {
            self.inner.write().entries.remove(&addr);
            return Err(e);
        }
        tracing::info!("Created wallet {}", addr);
        Ok((addr, keypair))
    }

    fn list_addresses(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }
}
