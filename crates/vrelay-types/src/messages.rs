//! Messages that carry stake state between the hub chain and execution chains.
//!
//! The hub registry and the per-chain trackers never call each other. The hub
//! publishes a `StakeSnapshot` after every mutation; execution chains publish a
//! `SlashReport` when they penalize a relayer. Both are applied idempotently.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Address, Amount, BlockNumber, ChainId, Hash32, Timestamp};

/// Point-in-time copy of one relayer's hub stake record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeSnapshot {
    pub relayer: Address,
    /// Bonded stake, already net of applied slashes.
    pub staked_amount: Amount,
    pub is_active: bool,
    pub supported_chains: BTreeSet<ChainId>,
    /// Per-relayer counter, strictly increasing on the hub.
    pub sequence: u64,
    /// Vouchers whose slash reports the hub has already applied.
    pub settled_slashes: BTreeSet<Hash32>,
    pub taken_at: Timestamp,
}

impl StakeSnapshot {
    pub fn supports(&self, chain_id: ChainId) -> bool {
        self.supported_chains.contains(&chain_id)
    }
}

/// Penalty decided on an execution chain, to be settled on the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashReport {
    pub voucher_id: Hash32,
    pub relayer: Address,
    pub penalty: Amount,
    /// Execution chain that decided the slash.
    pub chain_id: ChainId,
}

/// Attester's verdict on a destination-chain delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryVerdict {
    Delivered,
    Invalid,
}

/// Statement by an attester about what it observed on the destination chain.
///
/// Signed over `vrelay_crypto::ids::attestation_digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttestation {
    pub voucher_id: Hash32,
    pub request_id: Hash32,
    pub destination_chain_id: ChainId,
    pub recipient: Address,
    pub amount: Amount,
    pub verdict: DeliveryVerdict,
    /// Destination block at which the attester looked.
    pub observed_block: BlockNumber,
}
