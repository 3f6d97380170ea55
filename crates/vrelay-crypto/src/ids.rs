//! Identifier and signed-message digests.
//!
//! request_id      = keccak(tag, source chain, requester, tokens, amount, destination, recipient, nonce)
//! voucher_id      = keccak(tag, request_id, relayer, fee, source chain, destination chain)
//! commitment      = keccak(tag, request_id, relayer, amount, fee, destination chain)
//! attestation     = keccak(tag, voucher_id, request_id, destination chain, recipient, amount, verdict, block)
//! batch authority = keccak(tag, merkle_root, signer, origin chain)

use vrelay_types::{
    Address, Amount, ChainId, DeliveryAttestation, DeliveryVerdict, Hash32,
};

use crate::encoding::Encoder;

const REQUEST_TAG: &str = "vrelay.request.v1";
const VOUCHER_TAG: &str = "vrelay.voucher.v1";
const COMMITMENT_TAG: &str = "vrelay.commitment.v1";
const ATTESTATION_TAG: &str = "vrelay.attestation.v1";
const BATCH_TAG: &str = "vrelay.batch.v1";

/// Fields that make a transfer request unique.
#[derive(Debug, Clone, Copy)]
pub struct RequestPreimage<'a> {
    pub source_chain_id: ChainId,
    pub requester: &'a Address,
    pub source_token: &'a Address,
    pub destination_token: &'a Address,
    pub amount: Amount,
    pub destination_chain_id: ChainId,
    pub recipient: &'a Address,
    pub nonce: u64,
}

pub fn request_id(p: &RequestPreimage<'_>) -> Hash32 {
    Encoder::new()
        .tag(REQUEST_TAG)
        .u64(p.source_chain_id)
        .address(p.requester)
        .address(p.source_token)
        .address(p.destination_token)
        .u128(p.amount)
        .u64(p.destination_chain_id)
        .address(p.recipient)
        .u64(p.nonce)
        .keccak()
}

pub fn voucher_id(
    request_id: &Hash32,
    relayer: &Address,
    fee: Amount,
    source_chain_id: ChainId,
    destination_chain_id: ChainId,
) -> Hash32 {
    Encoder::new()
        .tag(VOUCHER_TAG)
        .hash(request_id)
        .address(relayer)
        .u128(fee)
        .u64(source_chain_id)
        .u64(destination_chain_id)
        .keccak()
}

/// Digest a relayer signs to bind itself to a fee for one request.
pub fn voucher_commitment(
    request_id: &Hash32,
    relayer: &Address,
    amount: Amount,
    fee: Amount,
    destination_chain_id: ChainId,
) -> Hash32 {
    Encoder::new()
        .tag(COMMITMENT_TAG)
        .hash(request_id)
        .address(relayer)
        .u128(amount)
        .u128(fee)
        .u64(destination_chain_id)
        .keccak()
}

pub fn attestation_digest(a: &DeliveryAttestation) -> Hash32 {
    let verdict = match a.verdict {
        DeliveryVerdict::Delivered => 1u8,
        DeliveryVerdict::Invalid => 2u8,
    };
    Encoder::new()
        .tag(ATTESTATION_TAG)
        .hash(&a.voucher_id)
        .hash(&a.request_id)
        .u64(a.destination_chain_id)
        .address(&a.recipient)
        .u128(a.amount)
        .u8(verdict)
        .u64(a.observed_block)
        .keccak()
}

/// Digest that one signature over a batch root commits to.
pub fn batch_authorization_digest(
    merkle_root: &Hash32,
    signer: &Address,
    origin_chain_id: ChainId,
) -> Hash32 {
    Encoder::new()
        .tag(BATCH_TAG)
        .hash(merkle_root)
        .address(signer)
        .u64(origin_chain_id)
        .keccak()
}
