//! Deterministic packed encoding fed into Keccak-256.
//!
//! Integers are big-endian at their natural width, byte strings carry an
//! 8-byte length prefix, so two different field lists never encode the same.

use sha3::{Digest, Keccak256};
use vrelay_types::{Address, Hash32};

pub fn keccak256(data: &[u8]) -> Hash32 {
    Hash32(Keccak256::digest(data).into())
}

/// Append-only byte buffer for hashing structured values.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domain tag, so identical field lists in different contexts hash apart.
    pub fn tag(self, tag: &str) -> Self {
        self.bytes(tag.as_bytes())
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u128(mut self, v: u128) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn address(mut self, a: &Address) -> Self {
        self.buf.extend_from_slice(a.as_bytes());
        self
    }

    pub fn hash(mut self, h: &Hash32) -> Self {
        self.buf.extend_from_slice(h.as_bytes());
        self
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        // usize never exceeds 64 bits on supported targets
        self.buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn keccak(self) -> Hash32 {
        keccak256(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_empty_vector() {
        assert_eq!(
            keccak256(b"").to_hex(),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_length_prefix_disambiguates() {
        let a = Encoder::new().bytes(b"ab").bytes(b"c").finish();
        let b = Encoder::new().bytes(b"a").bytes(b"bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bytes_prefix_is_full_width_length() {
        let enc = Encoder::new().bytes(&[0xaa; 300]).finish();
        assert_eq!(enc.len(), 8 + 300);
        assert_eq!(&enc[..8], &300u64.to_be_bytes());
        assert_eq!(enc[8], 0xaa);

        let empty = Encoder::new().bytes(b"").finish();
        assert_eq!(empty, vec![0u8; 8]);
    }

    #[test]
    fn test_integer_widths() {
        let enc = Encoder::new().u8(1).u64(2).u128(3).finish();
        assert_eq!(enc.len(), 1 + 8 + 16);
        assert_eq!(enc[8], 2);
        assert_eq!(enc[24], 3);
    }
}
