//! Per-chain collaborator interface and its implementations.
//!
//! A chain offers three capabilities: submit a call and get its receipt, query
//! or subscribe to its event log, and read its block height.
//!
//! - [`LocalChain`]: in-process chain running the hub registry or an execution ledger
//! - [`GatewayClient`]: HTTP client for a chain gateway speaking the same calls

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vrelay_ledger::{CreateRequestParams, IssueVoucherParams, SlashEvidence, VoucherDelivery};
use vrelay_merkle::SignedLeaf;
use vrelay_types::{
    Address, Amount, BlockNumber, ChainId, DeliveryAttestation, EventFilter, Hash32, LoggedEvent,
    RecoverableSignature, Result, SlashReport, StakeSnapshot,
};

pub mod gateway;
pub mod local;
pub mod subscription;

pub use gateway::GatewayClient;
pub use local::{ChainRole, LocalChain, LocalChainConfig};
pub use subscription::EventSubscription;

/// A protocol call, as carried in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainCall {
    // --- Execution chain ---
    CreateRequest(CreateRequestParams),
    Approve {
        spender: Address,
        token: Address,
        amount: Amount,
    },
    IssueVoucher(IssueVoucherParams),
    DeliverVoucher(VoucherDelivery),
    MarkFulfilled {
        attestation: DeliveryAttestation,
        signature: RecoverableSignature,
    },
    ClaimSourceFunds {
        voucher_id: Hash32,
    },
    Slash {
        voucher_id: Hash32,
        evidence: SlashEvidence,
    },
    RefundExpired {
        request_id: Hash32,
    },
    ApplyStakeSnapshot(StakeSnapshot),

    // --- Hub chain ---
    Register {
        supported_chains: BTreeSet<ChainId>,
        stake: Amount,
    },
    AddStake {
        amount: Amount,
    },
    SetSupportedChains {
        supported_chains: BTreeSet<ChainId>,
    },
    StartUnbonding {
        amount: Amount,
    },
    CompleteUnbonding,
    ApplySlashReport(SlashReport),

    // --- Any chain ---
    ExecuteBatchLeaf(SignedLeaf),
}

impl ChainCall {
    /// Short name used in logs and operation records.
    pub fn name(&self) -> &'static str {
        match self {
            ChainCall::CreateRequest(_) => "create_request",
            ChainCall::Approve { .. } => "approve",
            ChainCall::IssueVoucher(_) => "issue_voucher",
            ChainCall::DeliverVoucher(_) => "deliver_voucher",
            ChainCall::MarkFulfilled { .. } => "mark_fulfilled",
            ChainCall::ClaimSourceFunds { .. } => "claim_source_funds",
            ChainCall::Slash { .. } => "slash",
            ChainCall::RefundExpired { .. } => "refund_expired",
            ChainCall::ApplyStakeSnapshot(_) => "apply_stake_snapshot",
            ChainCall::Register { .. } => "register",
            ChainCall::AddStake { .. } => "add_stake",
            ChainCall::SetSupportedChains { .. } => "set_supported_chains",
            ChainCall::StartUnbonding { .. } => "start_unbonding",
            ChainCall::CompleteUnbonding => "complete_unbonding",
            ChainCall::ApplySlashReport(_) => "apply_slash_report",
            ChainCall::ExecuteBatchLeaf(_) => "execute_batch_leaf",
        }
    }
}

/// A call submitted by a chain-authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub from: Address,
    pub call: ChainCall,
}

impl TxRequest {
    pub fn new(from: Address, call: ChainCall) -> Self {
        Self { from, call }
    }
}

/// Inclusion receipt. `events` are the logs the call emitted, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Hash32,
    pub block_number: BlockNumber,
    pub events: Vec<LoggedEvent>,
}

/// What the relay core needs from a chain.
///
/// Rejected calls return the protocol error unchanged, so callers can tell a
/// precondition failure from a transport failure.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> ChainId;

    async fn block_number(&self) -> Result<BlockNumber>;

    /// Submit a call and wait for its inclusion.
    async fn submit(&self, tx: TxRequest) -> Result<Receipt>;

    /// Historical log query over `from..=to`.
    async fn events(
        &self,
        filter: &EventFilter,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LoggedEvent>>;

    /// Live events matching `filter`, starting after the current log head.
    async fn subscribe(&self, filter: EventFilter) -> Result<EventSubscription>;
}
