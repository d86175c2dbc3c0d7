// Thin re-export module: the ledger lives in `blockchain/core.rs`, split into
// chain storage, UTXO state and batch validation.

pub mod core;
pub use core::*;
