/// Transaction types for powchain
use crate::address;
use crate::encoding::{sha256, Encoder, Sha256Hash};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value minted by every coinbase transaction.
pub const REWARD: f64 = 12.5;
/// Output index carried by the single coinbase input.
pub const COINBASE_INDEX: i64 = -1;
/// Maximum serialized transaction size in bytes (100KB)
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// A reference to one output of an earlier transaction.
pub type OutPoint = (Vec<u8>, i64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TXInput {
    /// Id of the transaction holding the spent output; empty for coinbase.
    pub ref_tx_id: Vec<u8>,
    pub ref_index: i64,
    /// Raw `r || s` signature.
    pub signature: Vec<u8>,
    /// Raw `x || y` public key of the spender. Coinbase inputs carry their memo here.
    pub pub_key: Vec<u8>,
}

impl TXInput {
    pub fn outpoint(&self) -> OutPoint {
        (self.ref_tx_id.clone(), self.ref_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TXOutput {
    pub value: f64,
    /// Spending lock: hash of the recipient's public key.
    pub pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Builds an output locked to `address`.
    pub fn new(value: f64, address: &str) -> Result<Self, ChainError> {
        let pub_key_hash = address::pub_key_hash(address)?;
        Ok(TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        })
    }

    pub fn is_locked_with(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Sha256Hash,
    pub inputs: Vec<TXInput>,
    pub outputs: Vec<TXOutput>,
}

impl Transaction {
    /// Reward transaction paying [`REWARD`] to `address`, with `memo` stored
    /// in place of the input's public key. An empty memo is replaced with
    /// random bytes so two rewards to the same address get distinct ids.
    pub fn new_coinbase(address: &str, memo: &str) -> Result<Self, ChainError> {
        let memo = if memo.is_empty() {
            let salt: [u8; 20] = rand::random();
            format!("Reward to {} ({})", address, hex::encode(salt)).into_bytes()
        } else {
            memo.as_bytes().to_vec()
        };

        let mut tx = Transaction {
            id: [0u8; 32],
            inputs: vec![TXInput {
                ref_tx_id: Vec::new(),
                ref_index: COINBASE_INDEX,
                signature: Vec::new(),
                pub_key: memo,
            }],
            outputs: vec![TXOutput::new(REWARD, address)?],
        };
        tx.id = tx.compute_id();
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].ref_tx_id.is_empty()
            && self.inputs[0].ref_index == COINBASE_INDEX
    }

    /// Memo carried by a coinbase input, if this is one.
    pub fn coinbase_memo(&self) -> Option<String> {
        if self.is_coinbase() {
            Some(String::from_utf8_lossy(&self.inputs[0].pub_key).into_owned())
        } else {
            None
        }
    }

    pub fn id_str(&self) -> String {
        hex::encode(self.id)
    }

    /// Canonical encoding of every field, in declaration order.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_raw(&self.id);
        enc.put_u32(self.inputs.len() as u32);
        for input in &self.inputs {
            enc.put_bytes(&input.ref_tx_id)
                .put_i64(input.ref_index)
                .put_bytes(&input.signature)
                .put_bytes(&input.pub_key);
        }
        enc.put_u32(self.outputs.len() as u32);
        for output in &self.outputs {
            enc.put_f64(output.value).put_bytes(&output.pub_key_hash);
        }
        enc.finish()
    }

    /// Content id: hash of the encoding with `id` and every signature blanked.
    /// Public keys stay in, so attaching signatures leaves the id unchanged.
    pub fn compute_id(&self) -> Sha256Hash {
        let mut blank = self.clone();
        blank.id = [0u8; 32];
        for input in &mut blank.inputs {
            input.signature.clear();
        }
        sha256(&blank.encode())
    }

    /// Copy with the id kept and every signature and public key cleared.
    pub fn trimmed_copy(&self) -> Transaction {
        Transaction {
            id: self.id,
            inputs: self
                .inputs
                .iter()
                .map(|input| TXInput {
                    ref_tx_id: input.ref_tx_id.clone(),
                    ref_index: input.ref_index,
                    signature: Vec::new(),
                    pub_key: Vec::new(),
                })
                .collect(),
            outputs: self.outputs.clone(),
        }
    }

    pub fn total_output(&self) -> f64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }
}

/// Digest signed for input `input_index`: the trimmed copy with only that
/// input's public-key slot set to `lock` (the referenced output's
/// `pub_key_hash`), hashed as a whole.
pub fn signing_payload(
    tx: &Transaction,
    input_index: usize,
    lock: &[u8],
) -> Result<Sha256Hash, ChainError> {
    let mut copy = tx.trimmed_copy();
    let slot = copy.inputs.get_mut(input_index).ok_or_else(|| {
        ChainError::InvalidTransaction(format!(
            "Input {} out of range for transaction {}",
            input_index,
            tx.id_str()
        ))
    })?;
    slot.pub_key = lock.to_vec();
    Ok(sha256(&copy.encode()))
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}", self.id_str())?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.ref_tx_id))?;
            writeln!(f, "       Out:       {}", input.ref_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:     {:.6}", output.value)?;
            write!(f, "       Script:    {}", hex::encode(&output.pub_key_hash))?;
            if i + 1 < self.outputs.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
