//! Cryptographic primitives for powchain
//!
//! Public keys travel as 64 raw bytes (`x || y`, the uncompressed point
//! without its tag byte) and signatures as 64 raw bytes (`r || s`). Both are
//! split at fixed widths tied to secp256k1 rather than at `len / 2`.

use crate::encoding::sha256;
use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use ripemd::{Digest, Ripemd160};
use secp256k1::{
    constants::SECRET_KEY_SIZE, ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey,
};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Width of one affine coordinate of a secp256k1 point.
pub const COORDINATE_SIZE: usize = 32;
/// Width of one ECDSA scalar (`r` or `s`).
pub const SCALAR_SIZE: usize = 32;
pub const RAW_PUBLIC_KEY_SIZE: usize = 2 * COORDINATE_SIZE;
pub const SIGNATURE_SIZE: usize = 2 * SCALAR_SIZE;
pub const PUB_KEY_HASH_SIZE: usize = 20;

/// Tag byte of an uncompressed SEC1 point.
const UNCOMPRESSED_TAG: u8 = 0x04;

pub type PubKeyHash = [u8; PUB_KEY_HASH_SIZE];

/// RIPEMD-160 over SHA-256 of the raw public key.
pub fn hash_pub_key(public_key: &[u8]) -> PubKeyHash {
    Ripemd160::digest(sha256(public_key)).into()
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret_key.secret_bytes()
    }

    /// The raw `x || y` public key stored on transaction inputs.
    pub fn public_key_bytes(&self) -> [u8; RAW_PUBLIC_KEY_SIZE] {
        let uncompressed = self.public_key.serialize_uncompressed();
        let mut raw = [0u8; RAW_PUBLIC_KEY_SIZE];
        raw.copy_from_slice(&uncompressed[1..]);
        raw
    }

    pub fn pub_key_hash(&self) -> PubKeyHash {
        hash_pub_key(&self.public_key_bytes())
    }

    /// Signs a 32-byte digest as-is (no further hashing) and returns `r || s`.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> [u8; SIGNATURE_SIZE] {
        let message = Message::from_digest(*digest);
        SECP256K1_CONTEXT
            .sign_ecdsa(&message, &self.secret_key)
            .serialize_compact()
    }
}

/// Splits a raw signature into its `(r, s)` halves.
pub fn split_signature(signature: &[u8]) -> Result<(&[u8], &[u8]), ChainError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(ChainError::InvalidSignature(format!(
            "Signature must be exactly {} bytes, got {}",
            SIGNATURE_SIZE,
            signature.len()
        )));
    }
    Ok(signature.split_at(SCALAR_SIZE))
}

/// Splits a raw public key into its `(x, y)` coordinates.
pub fn split_public_key(public_key: &[u8]) -> Result<(&[u8], &[u8]), ChainError> {
    if public_key.len() != RAW_PUBLIC_KEY_SIZE {
        return Err(ChainError::InvalidSignature(format!(
            "Public key must be exactly {} bytes, got {}",
            RAW_PUBLIC_KEY_SIZE,
            public_key.len()
        )));
    }
    Ok(public_key.split_at(COORDINATE_SIZE))
}

/// Verifies an `r || s` signature over a 32-byte digest against an `x || y` key.
pub fn verify_digest(
    public_key_bytes: &[u8],
    digest: &[u8; 32],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    let (x, y) = split_public_key(public_key_bytes)?;
    let (r, s) = split_signature(signature_bytes)?;

    let mut sec1 = [0u8; 1 + RAW_PUBLIC_KEY_SIZE];
    sec1[0] = UNCOMPRESSED_TAG;
    sec1[1..1 + COORDINATE_SIZE].copy_from_slice(x);
    sec1[1 + COORDINATE_SIZE..].copy_from_slice(y);
    let public_key = PublicKey::from_slice(&sec1)
        .map_err(|e| ChainError::InvalidSignature(format!("Invalid public key: {}", e)))?;

    let mut compact = [0u8; SIGNATURE_SIZE];
    compact[..SCALAR_SIZE].copy_from_slice(r);
    compact[SCALAR_SIZE..].copy_from_slice(s);
    let signature = Signature::from_compact(&compact)
        .map_err(|e| ChainError::InvalidSignature(format!("Malformed signature: {}", e)))?;

    let message = Message::from_digest(*digest);
    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::InvalidSignature("Signature verification failed".to_string()))
}
