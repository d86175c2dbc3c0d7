use crate::crypto::hash_pub_key;
use crate::encoding::Sha256Hash;
use crate::error::ChainError;
use crate::persistence::{KvTransaction, UTXO_BUCKET};
use crate::transaction::{OutPoint, TXOutput};
use std::collections::{BTreeMap, HashSet};

use super::chain::{Block, BlockChain};

/// One unspent output located by a chain query.
#[derive(Debug, Clone, PartialEq)]
pub struct UTXOInfo {
    pub tx_id: Sha256Hash,
    pub index: i64,
    pub output: TXOutput,
}

/// Outputs picked to fund a transfer, grouped by transaction id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FundSelection {
    pub outputs: BTreeMap<Vec<u8>, Vec<i64>>,
    /// Sum of the selected values; may fall short of the requested amount.
    pub total: f64,
}

impl FundSelection {
    pub fn add(&mut self, tx_id: &[u8], index: i64, value: f64) {
        self.outputs.entry(tx_id.to_vec()).or_default().push(index);
        self.total += value;
    }

    /// Number of selected outputs.
    pub fn len(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Takes outputs in the given order until their sum reaches `amount`.
pub fn select_funds(utxos: &[UTXOInfo], amount: f64) -> FundSelection {
    let mut selection = FundSelection::default();
    for utxo in utxos {
        if selection.total >= amount {
            break;
        }
        selection.add(&utxo.tx_id, utxo.index, utxo.output.value);
    }
    selection
}

// ---------------------------------------------------------------------------
// Incremental unspent-output index
// ---------------------------------------------------------------------------

/// `txid || index` with the index as a big-endian `u32`.
pub(crate) fn utxo_key(tx_id: &[u8], index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(tx_id.len() + 4);
    key.extend_from_slice(tx_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn parse_utxo_key(key: &[u8]) -> Result<(Sha256Hash, i64), ChainError> {
    if key.len() != 32 + 4 {
        return Err(ChainError::CorruptStorage(format!(
            "UTXO key must be 36 bytes, got {}",
            key.len()
        )));
    }
    let mut tx_id = [0u8; 32];
    tx_id.copy_from_slice(&key[..32]);
    let mut index = [0u8; 4];
    index.copy_from_slice(&key[32..]);
    Ok((tx_id, i64::from(u32::from_be_bytes(index))))
}

/// Removes the outputs `block` spends and adds the ones it creates.
pub(crate) fn apply_block_to_index(
    tx: &mut dyn KvTransaction,
    block: &Block,
) -> Result<(), ChainError> {
    for transaction in &block.transactions {
        if !transaction.is_coinbase() {
            for input in &transaction.inputs {
                let index = u32::try_from(input.ref_index).map_err(|_| {
                    ChainError::InvalidTransaction(format!(
                        "Negative output index {} in {}",
                        input.ref_index,
                        transaction.id_str()
                    ))
                })?;
                tx.delete(UTXO_BUCKET, &utxo_key(&input.ref_tx_id, index))?;
            }
        }
        for (index, output) in transaction.outputs.iter().enumerate() {
            let bytes = bincode::serialize(output)?;
            tx.put(UTXO_BUCKET, &utxo_key(&transaction.id, index as u32), &bytes)?;
        }
    }
    Ok(())
}

impl BlockChain {
    /// Full rescan from the tail back to genesis. Within each transaction the
    /// inputs are recorded as spent before its outputs are considered, and
    /// newer blocks are visited first, so every spend is seen before the
    /// output it consumes.
    pub fn find_unspent_outputs(&self, pub_key_hash: &[u8]) -> Result<Vec<UTXOInfo>, ChainError> {
        let mut spent: HashSet<OutPoint> = HashSet::new();
        let mut unspent = Vec::new();

        for block in self.iter() {
            let block = block?;
            for tx in &block.transactions {
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        if hash_pub_key(&input.pub_key).as_slice() == pub_key_hash {
                            spent.insert(input.outpoint());
                        }
                    }
                }

                for (index, output) in tx.outputs.iter().enumerate() {
                    let index = index as i64;
                    if output.is_locked_with(pub_key_hash)
                        && !spent.contains(&(tx.id.to_vec(), index))
                    {
                        unspent.push(UTXOInfo {
                            tx_id: tx.id,
                            index,
                            output: output.clone(),
                        });
                    }
                }
            }
        }

        tracing::debug!(
            "Rescan found {} unspent outputs for {}",
            unspent.len(),
            hex::encode(pub_key_hash)
        );
        Ok(unspent)
    }

    pub fn find_needed_unspent_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: f64,
    ) -> Result<FundSelection, ChainError> {
        let utxos = self.find_unspent_outputs(pub_key_hash)?;
        Ok(select_funds(&utxos, amount))
    }

    /// Every outpoint consumed by some input on the chain.
    pub fn spent_outpoints(&self) -> Result<HashSet<OutPoint>, ChainError> {
        let mut spent = HashSet::new();
        for block in self.iter() {
            for tx in &block?.transactions {
                if !tx.is_coinbase() {
                    spent.extend(tx.inputs.iter().map(|input| input.outpoint()));
                }
            }
        }
        Ok(spent)
    }

    /// Same answer as [`BlockChain::find_unspent_outputs`], read from the index.
    pub fn find_unspent_outputs_indexed(
        &self,
        pub_key_hash: &[u8],
    ) -> Result<Vec<UTXOInfo>, ChainError> {
        let mut unspent = Vec::new();
        for (key, value) in self.store().iterate(UTXO_BUCKET)? {
            let output: TXOutput = bincode::deserialize(&value)?;
            if output.is_locked_with(pub_key_hash) {
                let (tx_id, index) = parse_utxo_key(&key)?;
                unspent.push(UTXOInfo {
                    tx_id,
                    index,
                    output,
                });
            }
        }
        Ok(unspent)
    }

    pub fn get_balance_indexed(&self, address: &str) -> Result<f64, ChainError> {
        let pub_key_hash = crate::address::pub_key_hash(address)?;
        Ok(self
            .find_unspent_outputs_indexed(&pub_key_hash)?
            .iter()
            .map(|u| u.output.value)
            .sum())
    }

    /// Rebuilds the index from scratch, oldest block first. Returns the
    /// number of unspent outputs indexed.
    pub fn reindex_utxo(&self) -> Result<usize, ChainError> {
        let mut blocks = self.iter().collect::<Result<Vec<_>, _>>()?;
        blocks.reverse();

        self.store().transact(&mut |tx| {
            tx.create_bucket(UTXO_BUCKET)?;
            tx.clear_bucket(UTXO_BUCKET)?;
            for block in &blocks {
                apply_block_to_index(tx, block)?;
            }
            Ok(())
        })?;

        let count = self.store().iterate(UTXO_BUCKET)?.len();
        tracing::info!(
            "Rebuilt UTXO index from {} blocks: {} unspent outputs",
            blocks.len(),
            count
        );
        Ok(count)
    }
}
