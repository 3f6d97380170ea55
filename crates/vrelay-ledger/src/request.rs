//! Transfer requests and their lifecycle states.

use serde::{Deserialize, Serialize};
use vrelay_auction::FeeSchedule;
use vrelay_types::{Address, Amount, BlockNumber, ChainId, Hash32};

/// Parameters a requester submits to `create_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequestParams {
    pub source_token: Address,
    pub destination_token: Address,
    pub amount: Amount,
    pub destination_chain_id: ChainId,
    pub recipient: Address,
    pub gas_on_destination: Amount,
    pub max_fee: Amount,
    pub fee_increment: Amount,
    pub deadline: BlockNumber,
    /// Caller-chosen; vary it to submit otherwise identical requests.
    pub nonce: u64,
}

/// Stored lifecycle status. Time-dependent states are derived in [`RequestState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    VoucherIssued,
    Fulfilled,
    Claimed,
    Refunded,
}

/// Request state at a given block, including the clock-driven states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Open,
    /// Open and past its deadline; refundable.
    Expired,
    VoucherIssued,
    /// Voucher past its delivery window; slashable.
    VoucherExpired,
    Fulfilled,
    /// Fulfilled and past the claim delay.
    Claimable,
    Claimed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub request_id: Hash32,
    pub requester: Address,
    pub source_chain_id: ChainId,
    pub source_token: Address,
    pub destination_token: Address,
    pub amount: Amount,
    pub destination_chain_id: ChainId,
    pub recipient: Address,
    pub gas_on_destination: Amount,
    pub max_fee: Amount,
    pub fee_increment: Amount,
    pub deadline: BlockNumber,
    pub created_block: BlockNumber,
    pub nonce: u64,
    pub status: RequestStatus,
    pub active_voucher: Option<Hash32>,
    /// Every voucher ever issued for this request, oldest first.
    pub voucher_history: Vec<Hash32>,
}

impl TransferRequest {
    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            max_fee: self.max_fee,
            fee_increment: self.fee_increment,
            created_block: self.created_block,
        }
    }

    /// Value held in escrow for this request.
    pub fn escrowed(&self) -> Amount {
        self.amount + self.max_fee
    }

    pub fn is_native(&self) -> bool {
        self.source_token == Address::NATIVE
    }

    pub fn claimed(&self) -> bool {
        self.status == RequestStatus::Claimed
    }

    /// Refunds only happen after expiry, so the two flags coincide.
    pub fn expired(&self) -> bool {
        self.status == RequestStatus::Refunded
    }

    pub fn refunded(&self) -> bool {
        self.status == RequestStatus::Refunded
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RequestStatus::Claimed | RequestStatus::Refunded)
    }
}
