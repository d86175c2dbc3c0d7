//! Error types for powchain

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: f64, available: f64 },
    #[error("Unknown reference: {0}")]
    UnknownReference(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Corrupt storage: {0}")]
    CorruptStorage(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Wallet error: {0}")]
    WalletError(String),
    #[error("Mining cancelled")]
    MiningCancelled,
    #[error("Nonce space exhausted")]
    NonceExhausted,
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::CorruptStorage(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
