//! Multi-chain batches: many chain-local operations authorized by one signature.
//!
//! The builder commits every operation to a Merkle root and signs
//! `(root, signer, origin chain)`. Each chain's verifier receives only its own
//! leaf and proof, recomputes the root and checks the signature. Chains execute
//! independently, so a batch may end up partially executed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vrelay_crypto::{ids, keccak256, recover_signer, sign_digest, Encoder, KeyPair};
use vrelay_types::{
    Address, Amount, ChainId, Hash32, RecoverableSignature, RelayError, Result,
};

use crate::{compute_root, MerkleTree};

const LEAF_TAG: &str = "vrelay.batch.leaf.v1";

/// One chain-local call inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub chain_id: ChainId,
    pub target: Address,
    #[serde(with = "vrelay_types::serde_hex")]
    pub payload: Vec<u8>,
    pub value: Amount,
    pub gas_limit: u64,
}

impl BatchOperation {
    pub fn encode(&self) -> Vec<u8> {
        Encoder::new()
            .tag(LEAF_TAG)
            .u64(self.chain_id)
            .address(&self.target)
            .u128(self.value)
            .u64(self.gas_limit)
            .bytes(&self.payload)
            .finish()
    }

    /// Double-hashed so a leaf can never be confused with an inner node.
    pub fn leaf_hash(&self) -> Hash32 {
        keccak256(keccak256(&self.encode()).as_bytes())
    }
}

/// The transient signing artifact. Nothing persists it after execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChainBatch {
    pub merkle_root: Hash32,
    pub leaves: Vec<BatchOperation>,
    pub proofs: Vec<Vec<Hash32>>,
    pub signer: Address,
    pub origin_chain_id: ChainId,
    pub signature: RecoverableSignature,
}

impl MultiChainBatch {
    /// Everything one executor needs for the leaf at `index`.
    pub fn signed_leaf(&self, index: usize) -> Option<SignedLeaf> {
        let operation = self.leaves.get(index)?.clone();
        let proof = self.proofs.get(index)?.clone();
        Some(SignedLeaf {
            operation,
            proof,
            merkle_root: self.merkle_root,
            signer: self.signer,
            origin_chain_id: self.origin_chain_id,
            signature: self.signature,
        })
    }

    /// Leaves destined for `chain_id`, in batch order.
    pub fn leaves_for_chain(&self, chain_id: ChainId) -> Vec<SignedLeaf> {
        (0..self.leaves.len())
            .filter(|i| self.leaves[*i].chain_id == chain_id)
            .filter_map(|i| self.signed_leaf(i))
            .collect()
    }

    /// Distinct chains touched by the batch, in first-seen order.
    pub fn chains(&self) -> Vec<ChainId> {
        let mut seen = Vec::new();
        for leaf in &self.leaves {
            if !seen.contains(&leaf.chain_id) {
                seen.push(leaf.chain_id);
            }
        }
        seen
    }
}

/// One leaf plus the authorization for it, as handed to a chain's executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLeaf {
    pub operation: BatchOperation,
    pub proof: Vec<Hash32>,
    pub merkle_root: Hash32,
    pub signer: Address,
    pub origin_chain_id: ChainId,
    pub signature: RecoverableSignature,
}

/// Collects operations and signs them as one batch.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    origin_chain_id: ChainId,
    operations: Vec<BatchOperation>,
}

impl BatchBuilder {
    pub fn new(origin_chain_id: ChainId) -> Self {
        Self {
            origin_chain_id,
            operations: Vec::new(),
        }
    }

    pub fn push(mut self, operation: BatchOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn extend(mut self, operations: impl IntoIterator<Item = BatchOperation>) -> Self {
        self.operations.extend(operations);
        self
    }

    pub fn build(self, signer: &KeyPair) -> Result<MultiChainBatch> {
        let hashes: Vec<Hash32> = self.operations.iter().map(BatchOperation::leaf_hash).collect();

        let mut unique = HashSet::with_capacity(hashes.len());
        for (i, h) in hashes.iter().enumerate() {
            if !unique.insert(*h) {
                return Err(RelayError::Validation(format!(
                    "duplicate operation at batch index {}",
                    i
                )));
            }
        }

        let tree = MerkleTree::from_leaves(hashes)
            .ok_or_else(|| RelayError::Validation("batch has no operations".into()))?;

        let proofs = (0..tree.leaf_count())
            .map(|i| tree.proof(i).unwrap_or_default())
            .collect();

        let merkle_root = tree.root();
        let digest =
            ids::batch_authorization_digest(&merkle_root, &signer.address(), self.origin_chain_id);
        let signature = sign_digest(signer, &digest)?;

        debug!(
            root = %merkle_root,
            leaves = self.operations.len(),
            origin_chain_id = self.origin_chain_id,
            "built multi-chain batch"
        );

        Ok(MultiChainBatch {
            merkle_root,
            leaves: self.operations,
            proofs,
            signer: signer.address(),
            origin_chain_id: self.origin_chain_id,
            signature,
        })
    }
}

/// Per-chain executor guard: membership, signature and replay checks.
#[derive(Debug, Clone)]
pub struct BatchVerifier {
    chain_id: ChainId,
    executed: HashSet<(Hash32, Hash32)>,
}

impl BatchVerifier {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            executed: HashSet::new(),
        }
    }

    /// Check a leaf without recording it. Returns the leaf hash.
    pub fn verify(&self, leaf: &SignedLeaf) -> Result<Hash32> {
        if leaf.operation.chain_id != self.chain_id {
            return Err(RelayError::Validation(format!(
                "leaf targets chain {}, this executor is chain {}",
                leaf.operation.chain_id, self.chain_id
            )));
        }

        let leaf_hash = leaf.operation.leaf_hash();
        if compute_root(&leaf_hash, &leaf.proof) != leaf.merkle_root {
            return Err(RelayError::Authorization(
                "merkle proof does not match signed root".into(),
            ));
        }

        let digest =
            ids::batch_authorization_digest(&leaf.merkle_root, &leaf.signer, leaf.origin_chain_id);
        let recovered = recover_signer(&digest, &leaf.signature)?;
        if recovered != leaf.signer {
            return Err(RelayError::Authorization(format!(
                "batch signature recovers to {}, claimed signer {}",
                recovered, leaf.signer
            )));
        }

        if self.executed.contains(&(leaf.merkle_root, leaf_hash)) {
            return Err(RelayError::Precondition(format!(
                "leaf {} of batch {} already executed",
                leaf_hash, leaf.merkle_root
            )));
        }

        Ok(leaf_hash)
    }

    /// Verify and record a leaf as executed.
    pub fn authorize(&mut self, leaf: &SignedLeaf) -> Result<Hash32> {
        let leaf_hash = self.verify(leaf)?;
        self.executed.insert((leaf.merkle_root, leaf_hash));
        Ok(leaf_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn signer() -> KeyPair {
        KeyPair::from_seed("batch signer seed 000001", None).unwrap()
    }

    fn op(chain_id: ChainId, n: u8) -> BatchOperation {
        BatchOperation {
            chain_id,
            target: Address::repeat_byte(n),
            payload: vec![n; (n as usize % 5) + 1],
            value: n as Amount,
            gas_limit: 100_000,
        }
    }

    fn batch(n: u8) -> MultiChainBatch {
        BatchBuilder::new(1)
            .extend((0..n).map(|i| op(10 + (i as u64 % 3), i)))
            .build(&signer())
            .unwrap()
    }

    #[test]
    fn test_empty_batch_rejected() {
        let err = BatchBuilder::new(1).build(&signer()).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_duplicate_operation_rejected() {
        let err = BatchBuilder::new(1)
            .push(op(10, 1))
            .push(op(10, 1))
            .build(&signer())
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_each_chain_executes_its_leaves_once() {
        let b = batch(7);
        assert_eq!(b.chains(), vec![10, 11, 12]);
        for chain in b.chains() {
            let mut verifier = BatchVerifier::new(chain);
            let leaves = b.leaves_for_chain(chain);
            assert!(!leaves.is_empty());
            for leaf in &leaves {
                verifier.authorize(leaf).unwrap();
                let replay = verifier.authorize(leaf).unwrap_err();
                assert!(matches!(replay, RelayError::Precondition(_)));
            }
        }
    }

    #[test]
    fn test_leaf_for_other_chain_rejected() {
        let b = batch(3);
        let leaf = b.leaves_for_chain(11).remove(0);
        let verifier = BatchVerifier::new(10);
        assert!(matches!(verifier.verify(&leaf), Err(RelayError::Validation(_))));
    }

    #[test]
    fn test_signature_bound_to_origin_chain_and_signer() {
        let b = batch(3);
        let mut leaf = b.signed_leaf(0).unwrap();
        leaf.origin_chain_id = 2;
        let verifier = BatchVerifier::new(leaf.operation.chain_id);
        assert!(verifier.verify(&leaf).is_err());

        let mut leaf = b.signed_leaf(0).unwrap();
        leaf.signer = Address::repeat_byte(0xee);
        assert!(matches!(
            verifier.verify(&leaf),
            Err(RelayError::Authorization(_))
        ));
    }

    #[test]
    fn test_batch_json_round_trip() {
        let b = batch(4);
        let json = serde_json::to_string(&b).unwrap();
        let back: MultiChainBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    proptest! {
        #[test]
        fn prop_single_byte_mutation_breaks_verification(
            n in 2u8..12,
            pick in 0usize..64,
            byte in 0usize..64,
            flip in 1u8..=255,
        ) {
            let b = batch(n);
            let index = pick % b.leaves.len();
            let leaf = b.signed_leaf(index).unwrap();
            let verifier = BatchVerifier::new(leaf.operation.chain_id);
            prop_assert!(verifier.verify(&leaf).is_ok());

            let mut bad_payload = leaf.clone();
            let i = byte % bad_payload.operation.payload.len();
            bad_payload.operation.payload[i] ^= flip;
            prop_assert!(verifier.verify(&bad_payload).is_err());

            let mut bad_target = leaf.clone();
            bad_target.operation.target.0[byte % 20] ^= flip;
            prop_assert!(verifier.verify(&bad_target).is_err());

            if !leaf.proof.is_empty() {
                let mut bad_proof = leaf.clone();
                let node = byte % bad_proof.proof.len();
                bad_proof.proof[node].0[byte % 32] ^= flip;
                prop_assert!(verifier.verify(&bad_proof).is_err());
            }
        }
    }
}
