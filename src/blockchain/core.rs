// Chain storage and traversal, UTXO derivation, and block-candidate checks.
pub mod chain;
pub mod state;
pub mod validation;

pub use chain::*;
pub use state::*;
pub use validation::*;
