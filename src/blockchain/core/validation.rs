use crate::error::ChainError;
use crate::transaction::validation::referenced_output;
use crate::transaction::{OutPoint, Transaction, UtxoProvider, REWARD};
use std::collections::HashSet;

use super::chain::BlockChain;

/// Slack allowed when comparing input and output totals.
pub const VALUE_TOLERANCE: f64 = 1e-9;

/// Candidate transactions split into those a block may carry and those it may not.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub valid: Vec<Transaction>,
    pub rejected: Vec<(Transaction, ChainError)>,
}

/// Running state while a batch is being checked in order.
struct BatchContext {
    spent_on_chain: HashSet<OutPoint>,
    claimed: HashSet<OutPoint>,
    ids: HashSet<[u8; 32]>,
    has_coinbase: bool,
}

fn is_storage_error(err: &ChainError) -> bool {
    matches!(
        err,
        ChainError::DatabaseError(_) | ChainError::CorruptStorage(_) | ChainError::NotFound(_)
    )
}

fn check_coinbase(tx: &Transaction, ctx: &BatchContext) -> Result<(), ChainError> {
    if ctx.has_coinbase {
        return Err(ChainError::InvalidTransaction(format!(
            "Coinbase {} rejected: block already has one",
            tx.id_str()
        )));
    }
    if tx.outputs.len() != 1 || tx.outputs[0].value != REWARD {
        return Err(ChainError::InvalidTransaction(format!(
            "Coinbase {} must pay exactly {} in a single output",
            tx.id_str(),
            REWARD
        )));
    }
    Ok(())
}

fn check_transfer(
    chain: &BlockChain,
    tx: &Transaction,
    ctx: &BatchContext,
) -> Result<(), ChainError> {
    let referenced = chain.referenced_transactions(tx)?;
    tx.check_signatures(&referenced)?;

    let mut own_claims = HashSet::new();
    let mut input_total = 0.0;
    for input in &tx.inputs {
        let outpoint = input.outpoint();
        if ctx.spent_on_chain.contains(&outpoint) {
            return Err(ChainError::InvalidTransaction(format!(
                "Output {}:{} is already spent",
                hex::encode(&input.ref_tx_id),
                input.ref_index
            )));
        }
        if ctx.claimed.contains(&outpoint) || !own_claims.insert(outpoint) {
            return Err(ChainError::InvalidTransaction(format!(
                "Output {}:{} is spent twice in this batch",
                hex::encode(&input.ref_tx_id),
                input.ref_index
            )));
        }
        input_total += referenced_output(input, &referenced)?.value;
    }

    let output_total = tx.total_output();
    if output_total > input_total + VALUE_TOLERANCE {
        return Err(ChainError::InvalidTransaction(format!(
            "Transaction {} spends {} but only has {}",
            tx.id_str(),
            output_total,
            input_total
        )));
    }
    Ok(())
}

fn check_candidate(
    chain: &BlockChain,
    tx: &Transaction,
    ctx: &BatchContext,
) -> Result<(), ChainError> {
    tx.validate_structure()?;

    if ctx.ids.contains(&tx.id) || chain.find_transaction(&tx.id)?.is_some() {
        return Err(ChainError::InvalidTransaction(format!(
            "Transaction {} is already recorded",
            tx.id_str()
        )));
    }

    if tx.is_coinbase() {
        check_coinbase(tx, ctx)
    } else {
        check_transfer(chain, tx, ctx)
    }
}

/// Checks `txs` in order against `chain`; the first transaction to claim an
/// output wins. Transaction-level failures are collected, never returned.
/// Storage failures abort the whole batch.
pub fn partition_batch(
    chain: &BlockChain,
    txs: Vec<Transaction>,
) -> Result<BatchOutcome, ChainError> {
    let mut ctx = BatchContext {
        spent_on_chain: chain.spent_outpoints()?,
        claimed: HashSet::new(),
        ids: HashSet::new(),
        has_coinbase: false,
    };
    let mut outcome = BatchOutcome::default();

    for tx in txs {
        match check_candidate(chain, &tx, &ctx) {
            Ok(()) => {
                if tx.is_coinbase() {
                    ctx.has_coinbase = true;
                } else {
                    ctx.claimed.extend(tx.inputs.iter().map(|input| input.outpoint()));
                }
                ctx.ids.insert(tx.id);
                outcome.valid.push(tx);
            }
            Err(e) if is_storage_error(&e) => return Err(e),
            Err(e) => {
                tracing::warn!("Dropping transaction {}: {}", tx.id_str(), e);
                outcome.rejected.push((tx, e));
            }
        }
    }

    Ok(outcome)
}
