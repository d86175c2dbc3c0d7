/// Signing, verification and construction of transfers, separated from the type definitions
use crate::blockchain::FundSelection;
use crate::crypto::{self, hash_pub_key, KeyPair, PUB_KEY_HASH_SIZE};
use crate::encoding::Sha256Hash;
use crate::error::ChainError;
use crate::transaction::types::{signing_payload, TXInput, TXOutput, Transaction};
use crate::wallet::KeyStore;
use std::collections::BTreeMap;

/// Transactions referenced by some inputs, keyed by id.
pub type ReferencedTxs = BTreeMap<Vec<u8>, Transaction>;

/// Chain queries a transfer needs in order to be built and signed.
pub trait UtxoProvider {
    fn find_needed_unspent_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: f64,
    ) -> Result<FundSelection, ChainError>;

    fn find_transaction(&self, id: &[u8]) -> Result<Option<Transaction>, ChainError>;

    /// Resolves every input's referenced transaction. Unresolvable references
    /// are logged and skipped; the caller's signature check reports them.
    fn referenced_transactions(&self, tx: &Transaction) -> Result<ReferencedTxs, ChainError> {
        let mut referenced = ReferencedTxs::new();
        if tx.is_coinbase() {
            return Ok(referenced);
        }
        for input in &tx.inputs {
            if referenced.contains_key(&input.ref_tx_id) {
                continue;
            }
            match self.find_transaction(&input.ref_tx_id)? {
                Some(prev) => {
                    referenced.insert(input.ref_tx_id.clone(), prev);
                }
                None => tracing::warn!(
                    "Transaction {} references unknown transaction {}",
                    tx.id_str(),
                    hex::encode(&input.ref_tx_id)
                ),
            }
        }
        Ok(referenced)
    }
}

/// The output an input spends, looked up in `referenced`.
pub(crate) fn referenced_output<'a>(
    input: &TXInput,
    referenced: &'a ReferencedTxs,
) -> Result<&'a TXOutput, ChainError> {
    let prev = referenced.get(&input.ref_tx_id).ok_or_else(|| {
        ChainError::UnknownReference(format!(
            "Transaction {} not found",
            hex::encode(&input.ref_tx_id)
        ))
    })?;
    usize::try_from(input.ref_index)
        .ok()
        .and_then(|i| prev.outputs.get(i))
        .ok_or_else(|| {
            ChainError::InvalidTransaction(format!(
                "Output index {} out of range for transaction {}",
                input.ref_index,
                prev.id_str()
            ))
        })
}

impl Transaction {
    /// Signs every input with `keypair`. Coinbase transactions are left untouched.
    pub fn sign(&mut self, keypair: &KeyPair, referenced: &ReferencedTxs) -> Result<(), ChainError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut signatures = Vec::with_capacity(self.inputs.len());
        for (i, input) in self.inputs.iter().enumerate() {
            let lock = &referenced_output(input, referenced)?.pub_key_hash;
            let payload = signing_payload(self, i, lock)?;
            tracing::debug!(input = i, payload = %hex::encode(payload), "Signing input");
            signatures.push(keypair.sign_digest(&payload));
        }

        for (input, signature) in self.inputs.iter_mut().zip(signatures) {
            input.signature = signature.to_vec();
        }
        Ok(())
    }

    /// Checks every input against the outputs it spends: the reference must
    /// resolve, the revealed public key must hash to the output's lock and
    /// the signature must verify over that input's signing payload.
    pub fn check_signatures(&self, referenced: &ReferencedTxs) -> Result<(), ChainError> {
        if self.is_coinbase() {
            return Ok(());
        }

        for (i, input) in self.inputs.iter().enumerate() {
            let output = referenced_output(input, referenced)?;

            if hash_pub_key(&input.pub_key).as_slice() != output.pub_key_hash.as_slice() {
                return Err(ChainError::InvalidSignature(format!(
                    "Input {} public key does not match the lock of {}:{}",
                    i,
                    hex::encode(&input.ref_tx_id),
                    input.ref_index
                )));
            }

            let payload = signing_payload(self, i, &output.pub_key_hash)?;
            tracing::debug!(input = i, payload = %hex::encode(payload), "Verifying input");
            crypto::verify_digest(&input.pub_key, &payload, &input.signature)?;
        }
        Ok(())
    }

    /// Boolean form of [`Transaction::check_signatures`]; failures are logged.
    pub fn verify(&self, referenced: &ReferencedTxs) -> bool {
        match self.check_signatures(referenced) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Transaction {} failed verification: {}", self.id_str(), e);
                false
            }
        }
    }

    /// Context-free checks: shape of inputs and outputs, values and id.
    pub fn validate_structure(&self) -> Result<(), ChainError> {
        self.validate_size()?;

        if self.inputs.is_empty() {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} has no inputs",
                self.id_str()
            )));
        }
        if self.outputs.is_empty() {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} has no outputs",
                self.id_str()
            )));
        }

        for output in &self.outputs {
            if !output.value.is_finite() || output.value < 0.0 {
                return Err(ChainError::InvalidTransaction(format!(
                    "Output value {} must be finite and non-negative",
                    output.value
                )));
            }
            if output.pub_key_hash.len() != PUB_KEY_HASH_SIZE {
                return Err(ChainError::InvalidTransaction(format!(
                    "Output lock must be {} bytes, got {}",
                    PUB_KEY_HASH_SIZE,
                    output.pub_key_hash.len()
                )));
            }
        }

        if !self.is_coinbase() {
            for input in &self.inputs {
                if input.ref_tx_id.len() != std::mem::size_of::<Sha256Hash>() || input.ref_index < 0 {
                    return Err(ChainError::InvalidTransaction(format!(
                        "Malformed input reference {}:{}",
                        hex::encode(&input.ref_tx_id),
                        input.ref_index
                    )));
                }
            }
        }

        let expected = self.compute_id();
        if expected != self.id {
            return Err(ChainError::InvalidTransaction(format!(
                "Id mismatch: stored {}, computed {}",
                self.id_str(),
                hex::encode(expected)
            )));
        }
        Ok(())
    }
}

/// Builds and signs a transfer of `amount` from `from` to `to`, adding a
/// change output back to `from` when the selected outputs exceed `amount`.
pub fn new_transfer(
    from: &str,
    to: &str,
    amount: f64,
    keys: &dyn KeyStore,
    utxo: &dyn UtxoProvider,
) -> Result<Transaction, ChainError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ChainError::InvalidTransaction(format!(
            "Transfer amount must be a positive number, got {}",
            amount
        )));
    }

    let recipient = TXOutput::new(amount, to)?;
    let keypair = keys
        .lookup(from)
        .ok_or_else(|| ChainError::WalletError(format!("No key pair for {}", from)))?;
    let pub_key_hash = keypair.pub_key_hash();

    let selection = utxo.find_needed_unspent_outputs(&pub_key_hash, amount)?;
    if selection.total < amount {
        return Err(ChainError::InsufficientFunds {
            needed: amount,
            available: selection.total,
        });
    }

    let pub_key = keypair.public_key_bytes().to_vec();
    let inputs = selection
        .outputs
        .iter()
        .flat_map(|(tx_id, indices)| {
            let pub_key = &pub_key;
            indices.iter().map(move |&index| TXInput {
                ref_tx_id: tx_id.clone(),
                ref_index: index,
                signature: Vec::new(),
                pub_key: pub_key.clone(),
            })
        })
        .collect();

    let mut outputs = vec![recipient];
    if selection.total > amount {
        outputs.push(TXOutput::new(selection.total - amount, from)?);
    }

    let mut tx = Transaction {
        id: [0u8; 32],
        inputs,
        outputs,
    };
    tx.id = tx.compute_id();

    let referenced = utxo.referenced_transactions(&tx)?;
    tx.sign(&keypair, &referenced)?;

    tracing::info!(
        "Built transfer {} of {} from {} to {} ({} inputs)",
        tx.id_str(),
        amount,
        from,
        to,
        tx.inputs.len()
    );
    Ok(tx)
}
