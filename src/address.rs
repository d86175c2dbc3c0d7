//! Base58Check address codec.
//!
//! Payload layout: 1 version byte, 20-byte public-key hash, 4-byte checksum.

use crate::crypto::{PubKeyHash, PUB_KEY_HASH_SIZE};
use crate::encoding::sha256;
use crate::error::ChainError;

pub const ADDRESS_VERSION: u8 = 0x00;
pub const CHECKSUM_SIZE: usize = 4;
const PAYLOAD_SIZE: usize = 1 + PUB_KEY_HASH_SIZE + CHECKSUM_SIZE;

/// First four bytes of a double SHA-256.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let second = sha256(&sha256(data));
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&second[..CHECKSUM_SIZE]);
    out
}

pub fn encode(pub_key_hash: &PubKeyHash) -> String {
    let mut payload = Vec::with_capacity(PAYLOAD_SIZE);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pub_key_hash);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);
    bs58::encode(payload).into_string()
}

/// Decodes an address into its full payload after checking length and checksum.
pub fn decode(address: &str) -> Result<Vec<u8>, ChainError> {
    let payload = bs58::decode(address.trim())
        .into_vec()
        .map_err(|e| ChainError::InvalidAddress(format!("{}: {}", address, e)))?;

    if payload.len() != PAYLOAD_SIZE {
        return Err(ChainError::InvalidAddress(format!(
            "{}: payload must be {} bytes, got {}",
            address,
            PAYLOAD_SIZE,
            payload.len()
        )));
    }

    let (body, check) = payload.split_at(payload.len() - CHECKSUM_SIZE);
    if checksum(body).as_slice() != check {
        return Err(ChainError::InvalidAddress(format!(
            "{}: checksum mismatch",
            address
        )));
    }
    Ok(payload)
}

/// `payload[1..len-4]` of a decoded address.
pub fn pub_key_hash(address: &str) -> Result<PubKeyHash, ChainError> {
    let payload = decode(address)?;
    let mut hash = [0u8; PUB_KEY_HASH_SIZE];
    hash.copy_from_slice(&payload[1..payload.len() - CHECKSUM_SIZE]);
    Ok(hash)
}

pub fn is_valid(address: &str) -> bool {
    decode(address).is_ok()
}
