//! Pair-sorted Keccak Merkle tree used to commit a multi-chain batch to one root.
//!
//! - Leaf hash: `keccak(keccak(encode(operation)))`
//! - Node hash: `keccak(min(a, b) || max(a, b))`, so proofs need no direction bits
//! - An odd node at any level is promoted unchanged

use vrelay_crypto::keccak256;
use vrelay_types::Hash32;

pub mod batch;

pub use batch::{BatchBuilder, BatchOperation, BatchVerifier, MultiChainBatch, SignedLeaf};

/// Hash two sibling nodes in canonical order.
pub fn hash_pair(a: &Hash32, b: &Hash32) -> Hash32 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_bytes());
    buf[32..].copy_from_slice(hi.as_bytes());
    keccak256(&buf)
}

/// Fold a proof into the root it implies for `leaf`.
pub fn compute_root(leaf: &Hash32, proof: &[Hash32]) -> Hash32 {
    proof
        .iter()
        .fold(*leaf, |current, sibling| hash_pair(&current, sibling))
}

pub fn verify_proof(leaf: &Hash32, proof: &[Hash32], root: &Hash32) -> bool {
    compute_root(leaf, proof) == *root
}

/// Fully materialized tree over a fixed leaf set.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] are the leaves, the last level holds the root.
    levels: Vec<Vec<Hash32>>,
}

impl MerkleTree {
    /// Build a tree. Returns `None` for an empty leaf set.
    pub fn from_leaves(leaves: Vec<Hash32>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let mut levels = vec![leaves];
        while levels.last().map_or(0, Vec::len) > 1 {
            let prev = levels.last().map(Vec::as_slice).unwrap_or_default();
            let next = prev
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_pair(a, b),
                    [a] => *a,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }
        Some(Self { levels })
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn root(&self) -> Hash32 {
        self.levels[self.levels.len() - 1][0]
    }

    /// Sibling path for the leaf at `index`, bottom-up.
    pub fn proof(&self, index: usize) -> Option<Vec<Hash32>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut path = Vec::with_capacity(self.levels.len());
        let mut pos = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = pos ^ 1;
            if sibling < level.len() {
                path.push(level[sibling]);
            }
            pos /= 2;
        }
        Some(path)
    }
}
