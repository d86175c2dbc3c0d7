//! powchain - a minimal proof-of-work ledger with UTXO accounting
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, chain storage, UTXO derivation and block validation
//! - [`transaction`] - Transaction types, signing and verification
//! - [`pow`] - Proof-of-work target, search and verification
//!
//! ## Primitives
//! - [`encoding`] - Canonical byte encoding and SHA-256
//! - [`crypto`] - secp256k1 key pairs and signatures
//! - [`address`] - Base58Check addresses
//!
//! ## State Management
//! - [`persistence`] - Key-value buckets (SQLite and in-memory)
//! - [`wallet`] - Key store
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`cli`] - Command handlers for the binary

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod pow;
pub mod transaction;

// ============================================================================
// Primitives
// ============================================================================
pub mod address;
pub mod crypto;
pub mod encoding;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;
pub mod wallet;

// ============================================================================
// Configuration & Utilities
// ============================================================================
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;

pub use blockchain::{Block, BlockChain, FundSelection, UTXOInfo};
pub use error::{ChainError, Result};
pub use transaction::{new_transfer, TXInput, TXOutput, Transaction, UtxoProvider};
pub use wallet::{KeyStore, Wallets};
