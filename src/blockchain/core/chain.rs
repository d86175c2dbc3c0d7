use crate::address;
use crate::crypto::KeyPair;
use crate::encoding::{sha256, Sha256Hash};
use crate::error::ChainError;
use crate::persistence::{KvStore, SqliteStore, BLOCKS_BUCKET, TAIL_KEY, UTXO_BUCKET};
use crate::pow::{ProofOfWork, MAX_DIFFICULTY_BITS};
use crate::transaction::{Transaction, UtxoProvider};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::state::{apply_block_to_index, FundSelection};
use super::validation::partition_batch;

pub const BLOCK_VERSION: u64 = 0;
pub const GENESIS_MEMO: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub version: u64,
    /// Empty only for the genesis block.
    pub prev_hash: Vec<u8>,
    pub merkle_root: Sha256Hash,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub difficulty_bits: u64,
    pub nonce: u64,
    pub transactions: Vec<Transaction>,
    pub hash: Sha256Hash,
}

impl Block {
    /// An unsolved block (nonce 0, zero hash) on top of `prev_hash`.
    pub fn assemble(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        difficulty_bits: u64,
    ) -> Result<Self, ChainError> {
        if transactions.is_empty() {
            return Err(ChainError::InvalidBlock(
                "A block needs at least one transaction".to_string(),
            ));
        }
        if difficulty_bits == 0 || difficulty_bits > MAX_DIFFICULTY_BITS {
            return Err(ChainError::InvalidBlock(format!(
                "Difficulty must be between 1 and {} bits, got {}",
                MAX_DIFFICULTY_BITS, difficulty_bits
            )));
        }

        let merkle_root = Block::calculate_merkle_root(&transactions);
        Ok(Block {
            version: BLOCK_VERSION,
            prev_hash,
            merkle_root,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            difficulty_bits,
            nonce: 0,
            transactions,
            hash: [0u8; 32],
        })
    }

    /// Assembles and solves a block with a single-threaded search.
    pub fn new(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        difficulty_bits: u64,
    ) -> Result<Self, ChainError> {
        let mut block = Block::assemble(transactions, prev_hash, difficulty_bits)?;
        block.mine(1, &AtomicBool::new(false))?;
        Ok(block)
    }

    /// Runs proof of work and records the winning nonce and hash.
    pub fn mine(&mut self, threads: usize, stop: &AtomicBool) -> Result<(), ChainError> {
        let (hash, nonce) = ProofOfWork::new(self).solve_parallel(threads, stop)?;
        self.hash = hash;
        self.nonce = nonce;
        Ok(())
    }

    /// Hash over the concatenated transaction ids.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Sha256Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.id);
        }
        hasher.finalize().into()
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Header hash recomputed from the fields and recorded nonce.
    pub fn compute_hash(&self) -> Sha256Hash {
        sha256(&ProofOfWork::new(self).prepare_header(self.nonce))
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, ChainError> {
        bincode::deserialize(bytes)
            .map_err(|e| ChainError::CorruptStorage(format!("Failed to decode block: {}", e)))
    }
}

/// Result of a successful append.
#[derive(Debug)]
pub struct AddBlockOutcome {
    pub block: Block,
    /// Candidates left out of the block, with the reason.
    pub rejected: Vec<(Transaction, ChainError)>,
}

/// Append-only chain of blocks stored by hash, with a pointer to the newest one.
pub struct BlockChain {
    store: Box<dyn KvStore>,
    tail: Sha256Hash,
    difficulty_bits: u64,
    mining_threads: usize,
    stop: Arc<AtomicBool>,
}

fn hash_from_bytes(bytes: &[u8]) -> Result<Sha256Hash, ChainError> {
    <Sha256Hash>::try_from(bytes).map_err(|_| {
        ChainError::CorruptStorage(format!("Expected a 32-byte hash, got {} bytes", bytes.len()))
    })
}

impl BlockChain {
    /// Initializes `store` with a genesis block paying the reward to `miner`.
    pub fn create(
        store: Box<dyn KvStore>,
        miner: &str,
        difficulty_bits: u64,
    ) -> Result<Self, ChainError> {
        address::decode(miner)?;
        if store.bucket_exists(BLOCKS_BUCKET)? {
            return Err(ChainError::AlreadyExists(
                "Blockchain already exists".to_string(),
            ));
        }

        let coinbase = Transaction::new_coinbase(miner, GENESIS_MEMO)?;
        let genesis = Block::new(vec![coinbase], Vec::new(), difficulty_bits)?;
        let bytes = genesis.serialize()?;

        store.transact(&mut |tx| {
            tx.create_bucket(BLOCKS_BUCKET)?;
            tx.create_bucket(UTXO_BUCKET)?;
            tx.put(BLOCKS_BUCKET, &genesis.hash, &bytes)?;
            tx.put(BLOCKS_BUCKET, TAIL_KEY, &genesis.hash)?;
            apply_block_to_index(tx, &genesis)
        })?;

        tracing::info!("Created blockchain, genesis block {}", genesis.hash_str());
        Ok(BlockChain {
            store,
            tail: genesis.hash,
            difficulty_bits,
            mining_threads: 1,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Loads an existing chain from `store`.
    pub fn open(store: Box<dyn KvStore>, difficulty_bits: u64) -> Result<Self, ChainError> {
        if !store.bucket_exists(BLOCKS_BUCKET)? {
            return Err(ChainError::NotFound(
                "Blockchain does not exist, create it first".to_string(),
            ));
        }
        let tail = store
            .get(BLOCKS_BUCKET, TAIL_KEY)?
            .ok_or_else(|| ChainError::CorruptStorage("Tail pointer is missing".to_string()))?;
        let tail = hash_from_bytes(&tail)?;

        let chain = BlockChain {
            store,
            tail,
            difficulty_bits,
            mining_threads: 1,
            stop: Arc::new(AtomicBool::new(false)),
        };

        if !chain.store.bucket_exists(UTXO_BUCKET)? {
            tracing::warn!("UTXO index missing, rebuilding it");
            chain.reindex_utxo()?;
        }
        tracing::debug!("Opened blockchain at tail {}", hex::encode(tail));
        Ok(chain)
    }

    /// [`BlockChain::create`] on a sqlite file that must not exist yet.
    pub fn create_at(path: &Path, miner: &str, difficulty_bits: u64) -> Result<Self, ChainError> {
        if path.exists() {
            return Err(ChainError::AlreadyExists(format!(
                "Blockchain already exists at {}",
                path.display()
            )));
        }
        address::decode(miner)?;

        let store = SqliteStore::open(path)?;
        BlockChain::create(Box::new(store), miner, difficulty_bits).inspect_err(|_| {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to clean up {}: {}", path.display(), e);
            }
        })
    }

    /// [`BlockChain::open`] on an existing sqlite file.
    pub fn open_at(path: &Path, difficulty_bits: u64) -> Result<Self, ChainError> {
        if !path.exists() {
            return Err(ChainError::NotFound(format!(
                "No blockchain at {}, create it first",
                path.display()
            )));
        }
        let store = SqliteStore::open(path)?;
        BlockChain::open(Box::new(store), difficulty_bits)
    }

    /// Uses a parallel nonce search with `threads` workers for new blocks.
    pub fn with_mining_threads(mut self, threads: usize) -> Self {
        self.mining_threads = threads.max(1);
        self
    }

    /// Flag that aborts an in-flight search when raised. `add_block` clears it
    /// again after the cancelled search returns.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn tail(&self) -> Sha256Hash {
        self.tail
    }

    pub fn difficulty_bits(&self) -> u64 {
        self.difficulty_bits
    }

    pub(crate) fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>, ChainError> {
        match self.store.get(BLOCKS_BUCKET, hash)? {
            Some(bytes) => Ok(Some(Block::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Walks from the tail back to genesis.
    pub fn iter(&self) -> BlockChainIterator<'_> {
        BlockChainIterator {
            store: self.store.as_ref(),
            current: Some(self.tail.to_vec()),
        }
    }

    pub fn block_count(&self) -> Result<usize, ChainError> {
        let mut count = 0;
        for block in self.iter() {
            block?;
            count += 1;
        }
        Ok(count)
    }

    /// Validates `txs`, mines a block from the valid ones and appends it.
    /// The block write, the tail update and the index update are one store
    /// transaction. If another handle moved the stored tail meanwhile, the
    /// block is discarded and this handle adopts the new tail.
    pub fn add_block(&mut self, txs: Vec<Transaction>) -> Result<AddBlockOutcome, ChainError> {
        let outcome = partition_batch(self, txs)?;
        if outcome.valid.is_empty() {
            return Err(ChainError::InvalidBlock(format!(
                "No valid transactions to include ({} rejected)",
                outcome.rejected.len()
            )));
        }

        let mut block = Block::assemble(outcome.valid, self.tail.to_vec(), self.difficulty_bits)?;
        if let Err(e) = block.mine(self.mining_threads, &self.stop) {
            if matches!(e, ChainError::MiningCancelled) {
                // A raised flag cancels this search only.
                self.stop.store(false, Ordering::Relaxed);
                tracing::info!("Mining cancelled, block discarded");
            }
            return Err(e);
        }
        let bytes = block.serialize()?;
        let expected_tail = self.tail;
        let mut moved_to = None;

        let written = self.store.transact(&mut |tx| {
            let current = tx.get(BLOCKS_BUCKET, TAIL_KEY)?;
            if current.as_deref() != Some(expected_tail.as_slice()) {
                moved_to = current;
                return Err(ChainError::InvalidBlock(
                    "Chain tail moved while mining".to_string(),
                ));
            }
            tx.put(BLOCKS_BUCKET, &block.hash, &bytes)?;
            tx.put(BLOCKS_BUCKET, TAIL_KEY, &block.hash)?;
            apply_block_to_index(tx, &block)
        });
        if let Err(e) = written {
            if let Some(current) = moved_to {
                self.tail = hash_from_bytes(&current)?;
                tracing::warn!(
                    "Another writer extended the chain, now at {}",
                    hex::encode(self.tail)
                );
            }
            return Err(e);
        }
        self.tail = block.hash;

        tracing::info!(
            "Mined block {} with {} transactions (nonce {})",
            block.hash_str(),
            block.transactions.len(),
            block.nonce
        );
        Ok(AddBlockOutcome {
            block,
            rejected: outcome.rejected,
        })
    }

    pub fn find_transaction(&self, id: &[u8]) -> Result<Option<Transaction>, ChainError> {
        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id.as_slice() == id) {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    pub fn get_balance(&self, address: &str) -> Result<f64, ChainError> {
        let pub_key_hash = address::pub_key_hash(address)?;
        Ok(self
            .find_unspent_outputs(&pub_key_hash)?
            .iter()
            .map(|u| u.output.value)
            .sum())
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, keypair: &KeyPair) -> Result<(), ChainError> {
        let referenced = self.referenced_transactions(tx)?;
        tx.sign(keypair, &referenced)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let referenced = self.referenced_transactions(tx)?;
        Ok(tx.verify(&referenced))
    }

    /// Audits every stored block: proof of work, recorded hash, merkle root
    /// and predecessor links. Returns the number of blocks checked.
    pub fn verify_chain(&self) -> Result<usize, ChainError> {
        let mut expected = self.tail;
        let mut count = 0;

        for block in self.iter() {
            let block = block?;
            if block.hash != expected {
                return Err(ChainError::InvalidBlock(format!(
                    "Block stored under {} claims hash {}",
                    hex::encode(expected),
                    block.hash_str()
                )));
            }
            if block.compute_hash() != block.hash {
                return Err(ChainError::InvalidBlock(format!(
                    "Block {} hash does not match its header",
                    block.hash_str()
                )));
            }
            if !ProofOfWork::new(&block).verify() {
                return Err(ChainError::InvalidBlock(format!(
                    "Block {} fails proof of work",
                    block.hash_str()
                )));
            }
            if Block::calculate_merkle_root(&block.transactions) != block.merkle_root {
                return Err(ChainError::InvalidBlock(format!(
                    "Block {} merkle root mismatch",
                    block.hash_str()
                )));
            }
            for tx in &block.transactions {
                tx.validate_structure()?;
            }

            count += 1;
            if !block.is_genesis() {
                expected = hash_from_bytes(&block.prev_hash)?;
            }
        }

        tracing::info!("Verified {} blocks", count);
        Ok(count)
    }
}

impl UtxoProvider for BlockChain {
    fn find_needed_unspent_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: f64,
    ) -> Result<FundSelection, ChainError> {
        BlockChain::find_needed_unspent_outputs(self, pub_key_hash, amount)
    }

    fn find_transaction(&self, id: &[u8]) -> Result<Option<Transaction>, ChainError> {
        BlockChain::find_transaction(self, id)
    }
}

/// Yields blocks newest first until the genesis block has been returned.
pub struct BlockChainIterator<'a> {
    store: &'a dyn KvStore,
    current: Option<Vec<u8>>,
}

impl Iterator for BlockChainIterator<'_> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current.take()?;
        let bytes = match self.store.get(BLOCKS_BUCKET, &hash) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return Some(Err(ChainError::CorruptStorage(format!(
                    "Block {} is missing",
                    hex::encode(&hash)
                ))))
            }
            Err(e) => return Some(Err(e)),
        };

        let block = match Block::deserialize(&bytes) {
            Ok(block) => block,
            Err(e) => return Some(Err(e)),
        };
        if !block.is_genesis() {
            self.current = Some(block.prev_hash.clone());
        }
        Some(Ok(block))
    }
}
