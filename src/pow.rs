//! Proof-of-work puzzle over block headers.
//!
//! A header solves the puzzle when `sha256(prepare_header(nonce))`, read as a
//! big-endian unsigned integer, is strictly below `2^(256 - bits)`.

use crate::blockchain::Block;
use crate::encoding::{uint_to_bytes, Encoder, Sha256Hash};
use crate::error::ChainError;
use num_bigint::BigUint;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};

/// Bits used for new blocks unless configured otherwise.
pub const DEFAULT_DIFFICULTY_BITS: u64 = 16;
/// Highest difficulty for which at least one hash value (zero) can succeed.
pub const MAX_DIFFICULTY_BITS: u64 = 255;

/// `2^(256 - bits)`; larger `bits` means a smaller target and a harder puzzle.
pub fn target(bits: u64) -> BigUint {
    let shift = 256 - bits.min(256);
    BigUint::from(1u8) << shift as usize
}

pub fn meets_target(hash: &Sha256Hash, target: &BigUint) -> bool {
    BigUint::from_bytes_be(hash) < *target
}

pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: BigUint,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Self {
        ProofOfWork {
            block,
            target: target(block.difficulty_bits),
        }
    }

    pub fn target(&self) -> &BigUint {
        &self.target
    }

    /// Header fields ahead of the nonce; constant for the whole search.
    fn header_prefix(&self) -> Vec<u8> {
        let block = self.block;
        let mut enc = Encoder::new();
        enc.put_u64(block.version)
            .put_raw(&block.prev_hash)
            .put_raw(&block.merkle_root)
            .put_u64(block.timestamp)
            .put_u64(block.difficulty_bits);
        enc.finish()
    }

    /// `version || prevHash || merkleRoot || timestamp || bits || nonce`.
    /// The block's own hash and transaction payload are not part of it.
    pub fn prepare_header(&self, nonce: u64) -> Vec<u8> {
        let mut data = self.header_prefix();
        data.extend_from_slice(&uint_to_bytes(nonce));
        data
    }

    fn hash_with_prefix(prefix: &[u8], nonce: u64) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(prefix);
        hasher.update(uint_to_bytes(nonce));
        hasher.finalize().into()
    }

    /// Sequential search from nonce 0. Never returns `MiningCancelled`.
    pub fn solve(&self) -> Result<(Sha256Hash, u64), ChainError> {
        self.solve_with_cancel(&AtomicBool::new(false))
    }

    /// Sequential search that gives up once `stop` is raised.
    pub fn solve_with_cancel(&self, stop: &AtomicBool) -> Result<(Sha256Hash, u64), ChainError> {
        let prefix = self.header_prefix();
        let mut nonce: u64 = 0;
        loop {
            if stop.load(Ordering::Relaxed) {
                return Err(ChainError::MiningCancelled);
            }
            let hash = Self::hash_with_prefix(&prefix, nonce);
            if meets_target(&hash, &self.target) {
                tracing::debug!(nonce, hash = %hex::encode(hash), "Proof of work found");
                return Ok((hash, nonce));
            }
            nonce = nonce.checked_add(1).ok_or(ChainError::NonceExhausted)?;
        }
    }

    /// Stripes the nonce space across `threads` workers; the first valid nonce
    /// any worker finds wins, so the result need not be the smallest one.
    pub fn solve_parallel(
        &self,
        threads: usize,
        stop: &AtomicBool,
    ) -> Result<(Sha256Hash, u64), ChainError> {
        let threads = threads.max(1);
        if threads == 1 {
            return self.solve_with_cancel(stop);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| ChainError::ConfigError(format!("Failed to build mining pool: {}", e)))?;

        let prefix = self.header_prefix();
        let found = AtomicBool::new(false);
        let stride = threads as u64;

        let result = pool.install(|| {
            (0..stride).into_par_iter().find_map_any(|start| {
                let mut nonce = start;
                loop {
                    if found.load(Ordering::Relaxed) || stop.load(Ordering::Relaxed) {
                        return None;
                    }
                    let hash = Self::hash_with_prefix(&prefix, nonce);
                    if meets_target(&hash, &self.target) {
                        found.store(true, Ordering::Relaxed);
                        return Some((hash, nonce));
                    }
                    nonce = nonce.checked_add(stride)?;
                }
            })
        });

        match result {
            Some(solution) => Ok(solution),
            None if stop.load(Ordering::Relaxed) => Err(ChainError::MiningCancelled),
            None => Err(ChainError::NonceExhausted),
        }
    }

    /// Recomputes the header hash with the block's recorded nonce.
    pub fn verify(&self) -> bool {
        let hash = Self::hash_with_prefix(&self.header_prefix(), self.block.nonce);
        meets_target(&hash, &self.target)
    }
}
