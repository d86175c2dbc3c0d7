//! Canonical byte encoding and hashing primitives.
//!
//! Numeric fields are written as fixed-width big-endian integers. Variable
//! length byte sequences carry a `u32` big-endian length prefix so two
//! different field layouts can never produce the same byte string.

use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

/// Fixed-width big-endian encoding of a `u64`.
pub fn uint_to_bytes(num: u64) -> [u8; 8] {
    num.to_be_bytes()
}

pub fn sha256(data: &[u8]) -> Sha256Hash {
    Sha256::digest(data).into()
}

/// Append-only builder for canonical encodings.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&uint_to_bytes(value));
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Floats are encoded through their IEEE-754 bit pattern.
    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.put_u64(value.to_bits())
    }

    /// Length-prefixed byte sequence.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        // Fields are bounded far below u32::MAX by transaction size limits.
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Raw bytes without a length prefix, for fixed-width fields.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_to_bytes_is_big_endian() {
        assert_eq!(uint_to_bytes(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(uint_to_bytes(0x0102), [0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_length_prefix_disambiguates_fields() {
        let mut a = Encoder::new();
        a.put_bytes(b"ab").put_bytes(b"c");
        let mut b = Encoder::new();
        b.put_bytes(b"a").put_bytes(b"bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_negative_index_encoding() {
        let mut enc = Encoder::new();
        enc.put_i64(-1);
        assert_eq!(enc.finish(), vec![0xFF; 8]);
    }
}
