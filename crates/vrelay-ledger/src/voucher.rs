//! Vouchers: exclusive, signed commitments by one relayer to fill one request.

use serde::{Deserialize, Serialize};
use vrelay_types::{
    Address, Amount, BlockNumber, ChainId, DeliveryAttestation, Hash32, RecoverableSignature,
};

/// Relayer submission for `issue_voucher`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueVoucherParams {
    pub request_id: Hash32,
    pub relayer: Address,
    pub fee: Amount,
    /// Relayer signature over `ids::voucher_commitment`.
    pub signature: RecoverableSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherStatus {
    Issued,
    Fulfilled,
    Claimed,
    Slashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub voucher_id: Hash32,
    pub request_id: Hash32,
    pub relayer: Address,
    pub fee: Amount,
    pub source_chain_id: ChainId,
    pub destination_chain_id: ChainId,
    pub source_token: Address,
    pub destination_token: Address,
    pub amount: Amount,
    pub recipient: Address,
    pub gas_provided: Amount,
    pub issued_block: BlockNumber,
    pub expires_block: BlockNumber,
    pub fulfilled_block: Option<BlockNumber>,
    pub attester: Option<Address>,
    pub status: VoucherStatus,
}

impl Voucher {
    pub fn fulfilled(&self) -> bool {
        matches!(self.status, VoucherStatus::Fulfilled | VoucherStatus::Claimed)
    }

    pub fn slashed(&self) -> bool {
        self.status == VoucherStatus::Slashed
    }

    /// Issued, undelivered and out of delivery window.
    pub fn is_stale(&self, now: BlockNumber) -> bool {
        self.status == VoucherStatus::Issued && now >= self.expires_block
    }

    pub fn claimable_at(&self, claim_delay_blocks: BlockNumber) -> Option<BlockNumber> {
        self.fulfilled_block
            .map(|b| b.saturating_add(claim_delay_blocks))
    }
}

/// What a relayer hands the destination chain when paying out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherDelivery {
    pub voucher_id: Hash32,
    pub request_id: Hash32,
    pub source_chain_id: ChainId,
    pub recipient: Address,
    pub token: Address,
    pub amount: Amount,
    pub gas: Amount,
}

impl VoucherDelivery {
    pub fn for_voucher(voucher: &Voucher) -> Self {
        Self {
            voucher_id: voucher.voucher_id,
            request_id: voucher.request_id,
            source_chain_id: voucher.source_chain_id,
            recipient: voucher.recipient,
            token: voucher.destination_token,
            amount: voucher.amount,
            gas: voucher.gas_provided,
        }
    }
}

/// Grounds for slashing a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashEvidence {
    /// The voucher reached `expires_block` undelivered. Needs no proof.
    DeliveryTimeout,
    /// An attester's `Invalid` verdict, presented inside the claim delay.
    Fraud {
        attestation: DeliveryAttestation,
        signature: RecoverableSignature,
    },
}
