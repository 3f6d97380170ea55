//! Relayer flow: find open requests, bid, pay out on the destination chain,
//! then claim the escrow once the dispute window has passed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vrelay_auction::{plan_bid, BidDecision, BidPolicy, FeeSchedule};
use vrelay_chain::{ChainCall, Receipt, TxRequest};
use vrelay_crypto::{ids, sign_digest, KeyPair};
use vrelay_ledger::{IssueVoucherParams, VoucherDelivery};
use vrelay_types::{
    Address, Amount, BlockNumber, ChainId, EventFilter, EventKind, Hash32, LoggedEvent,
    ProtocolEvent, RelayError, Result,
};

use crate::orchestrator::{OperationType, Orchestrator, WaitOutcome};

/// Terms of a request, read from its `RequestCreated` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub request_id: Hash32,
    pub source_chain_id: ChainId,
    pub requester: Address,
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
}

impl OpenRequest {
    pub fn from_event(logged: &LoggedEvent) -> Option<Self> {
        match &logged.event {
            ProtocolEvent::RequestCreated {
                request_id,
                requester,
                source_token,
                destination_token,
                amount,
                destination_chain_id,
                recipient,
                gas_on_destination,
                max_fee,
                fee_increment,
                deadline,
                created_block,
            } => Some(Self {
                request_id: *request_id,
                source_chain_id: logged.chain_id,
                requester: *requester,
                source_token: *source_token,
                destination_token: *destination_token,
                amount: *amount,
                destination_chain_id: *destination_chain_id,
                recipient: *recipient,
                gas_on_destination: *gas_on_destination,
                max_fee: *max_fee,
                fee_increment: *fee_increment,
                deadline: *deadline,
                created_block: *created_block,
            }),
            _ => None,
        }
    }

    pub fn schedule(&self) -> FeeSchedule {
        FeeSchedule {
            max_fee: self.max_fee,
            fee_increment: self.fee_increment,
            created_block: self.created_block,
        }
    }

    /// What the destination chain must see for this request to count as filled.
    pub fn delivery(&self, voucher_id: Hash32) -> VoucherDelivery {
        VoucherDelivery {
            voucher_id,
            request_id: self.request_id,
            source_chain_id: self.source_chain_id,
            recipient: self.recipient,
            token: self.destination_token,
            amount: self.amount,
            gas: self.gas_on_destination,
        }
    }
}

/// What to do about an open request right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Bid { fee: Amount },
    WaitUntil(BlockNumber),
    Skip(String),
}

/// A voucher this relayer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedVoucher {
    pub voucher_id: Hash32,
    pub request: OpenRequest,
    pub fee: Amount,
    pub issued_block: BlockNumber,
    pub expires_block: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Claimed { voucher_id: Hash32, payout: Amount },
    Skipped(String),
    TimedOut,
    Cancelled,
}

pub struct RelayerAgent {
    key: KeyPair,
    policy: BidPolicy,
    orch: Arc<Orchestrator>,
}

impl RelayerAgent {
    pub fn new(key: KeyPair, policy: BidPolicy, orch: Arc<Orchestrator>) -> Self {
        Self { key, policy, orch }
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    /// Bond `amount` on the hub for `supported_chains`.
    pub async fn register(
        &self,
        hub_chain_id: ChainId,
        supported_chains: BTreeSet<ChainId>,
        amount: Amount,
    ) -> Result<Receipt> {
        self.orch
            .submit(
                OperationType::Stake,
                hub_chain_id,
                TxRequest::new(
                    self.address(),
                    ChainCall::Register {
                        supported_chains,
                        stake: amount,
                    },
                ),
            )
            .await
    }

    /// Requests on `source_chain_id` created since `from_block` that are open
    /// now, oldest first. A slashed voucher reopens its request.
    pub async fn discover(
        &self,
        source_chain_id: ChainId,
        from_block: BlockNumber,
    ) -> Result<Vec<OpenRequest>> {
        let filter = EventFilter {
            kinds: vec![
                EventKind::RequestCreated,
                EventKind::VoucherIssued,
                EventKind::VoucherSlashed,
                EventKind::RequestRefunded,
            ],
            ..Default::default()
        };
        let events = self
            .orch
            .history(source_chain_id, &filter, from_block)
            .await?;

        let mut order = Vec::new();
        let mut open: HashMap<Hash32, (OpenRequest, bool)> = HashMap::new();
        for logged in &events {
            match &logged.event {
                ProtocolEvent::RequestCreated { request_id, .. } => {
                    if let Some(req) = OpenRequest::from_event(logged) {
                        order.push(*request_id);
                        open.insert(*request_id, (req, true));
                    }
                }
                ProtocolEvent::VoucherIssued { request_id, .. }
                | ProtocolEvent::RequestRefunded { request_id, .. } => {
                    if let Some(entry) = open.get_mut(request_id) {
                        entry.1 = false;
                    }
                }
                ProtocolEvent::VoucherSlashed { request_id, .. } => {
                    if let Some(entry) = open.get_mut(request_id) {
                        entry.1 = true;
                    }
                }
                _ => {}
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| open.remove(&id))
            .filter(|(_, is_open)| *is_open)
            .map(|(req, _)| req)
            .collect())
    }

    pub fn plan(&self, request: &OpenRequest, now: BlockNumber) -> NextAction {
        if self.orch.chain(request.destination_chain_id).is_err() {
            return NextAction::Skip(format!(
                "destination chain {} not reachable",
                request.destination_chain_id
            ));
        }
        match plan_bid(
            &request.schedule(),
            request.gas_on_destination,
            request.deadline,
            now,
            &self.policy,
        ) {
            BidDecision::Bid { fee } => NextAction::Bid { fee },
            BidDecision::WaitUntil(block) => NextAction::WaitUntil(block),
            BidDecision::Decline(reason) => NextAction::Skip(reason),
        }
    }

    /// Sign a commitment to `fee` and take the voucher.
    #[tracing::instrument(skip_all, fields(request_id = %request.request_id, fee = fee))]
    pub async fn issue_voucher(&self, request: &OpenRequest, fee: Amount) -> Result<IssuedVoucher> {
        let relayer = self.address();
        let commitment = ids::voucher_commitment(
            &request.request_id,
            &relayer,
            request.amount,
            fee,
            request.destination_chain_id,
        );
        let params = IssueVoucherParams {
            request_id: request.request_id,
            relayer,
            fee,
            signature: sign_digest(&self.key, &commitment)?,
        };
        let receipt = self
            .orch
            .submit(
                OperationType::IssueVoucher,
                request.source_chain_id,
                TxRequest::new(relayer, ChainCall::IssueVoucher(params)),
            )
            .await?;

        let issued = receipt
            .events
            .iter()
            .find_map(|e| match e.event {
                ProtocolEvent::VoucherIssued {
                    voucher_id,
                    request_id,
                    fee,
                    issued_block,
                    expires_block,
                    ..
                } if request_id == request.request_id => Some(IssuedVoucher {
                    voucher_id,
                    request: request.clone(),
                    fee,
                    issued_block,
                    expires_block,
                }),
                _ => None,
            })
            .ok_or_else(|| RelayError::Other("receipt carries no VoucherIssued event".into()))?;

        info!(voucher_id = %issued.voucher_id, expires_block = issued.expires_block, "voucher taken");
        Ok(issued)
    }

    /// Pay the recipient on the destination chain.
    pub async fn deliver(&self, voucher: &IssuedVoucher) -> Result<Receipt> {
        let request = &voucher.request;
        self.orch
            .submit(
                OperationType::Deliver,
                request.destination_chain_id,
                TxRequest::new(
                    self.address(),
                    ChainCall::DeliverVoucher(request.delivery(voucher.voucher_id)),
                ),
            )
            .await
    }

    /// Wait for an attester to mark the voucher fulfilled. Yields `claimable_at`.
    pub async fn wait_fulfilled(
        &self,
        voucher: &IssuedVoucher,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome<BlockNumber>> {
        let outcome = self
            .orch
            .wait_for_event(
                voucher.request.source_chain_id,
                EventFilter::kind(EventKind::VoucherFulfilled).with_voucher(voucher.voucher_id),
                voucher.issued_block,
                timeout,
                cancel,
            )
            .await?;
        Ok(outcome.map(|logged| match logged.event {
            ProtocolEvent::VoucherFulfilled { claimable_at, .. } => claimable_at,
            _ => logged.block_number,
        }))
    }

    /// Wait for the dispute window to close, then claim.
    #[tracing::instrument(skip_all, fields(voucher_id = %voucher.voucher_id, claimable_at = claimable_at))]
    pub async fn claim_when_ready(
        &self,
        voucher: &IssuedVoucher,
        claimable_at: BlockNumber,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome<Receipt>> {
        let source = voucher.request.source_chain_id;
        match self
            .orch
            .wait_for_block(source, claimable_at, timeout, cancel)
            .await?
        {
            WaitOutcome::Ready(_) => {}
            WaitOutcome::TimedOut => return Ok(WaitOutcome::TimedOut),
            WaitOutcome::Cancelled => return Ok(WaitOutcome::Cancelled),
        }
        let receipt = self
            .orch
            .submit(
                OperationType::Claim,
                source,
                TxRequest::new(
                    self.address(),
                    ChainCall::ClaimSourceFunds {
                        voucher_id: voucher.voucher_id,
                    },
                ),
            )
            .await?;
        Ok(WaitOutcome::Ready(receipt))
    }

    /// Run one request from bid to claim.
    #[tracing::instrument(skip_all, fields(request_id = %request.request_id))]
    pub async fn relay(
        &self,
        request: &OpenRequest,
        cancel: &CancellationToken,
    ) -> Result<RelayOutcome> {
        let source = request.source_chain_id;
        let timeout = self.orch.event_timeout();

        let fee = loop {
            let now = self.orch.block_number(source).await?;
            match self.plan(request, now) {
                NextAction::Bid { fee } => break fee,
                NextAction::Skip(reason) => {
                    debug!(%reason, "request skipped");
                    return Ok(RelayOutcome::Skipped(reason));
                }
                NextAction::WaitUntil(block) => {
                    match self.orch.wait_for_block(source, block, timeout, cancel).await? {
                        WaitOutcome::Ready(_) => continue,
                        WaitOutcome::TimedOut => return Ok(RelayOutcome::TimedOut),
                        WaitOutcome::Cancelled => return Ok(RelayOutcome::Cancelled),
                    }
                }
            }
        };

        let voucher = self.issue_voucher(request, fee).await?;
        self.deliver(&voucher).await?;

        let claimable_at = match self.wait_fulfilled(&voucher, timeout, cancel).await? {
            WaitOutcome::Ready(at) => at,
            WaitOutcome::TimedOut => {
                warn!(voucher_id = %voucher.voucher_id, "delivered but not attested in time");
                return Ok(RelayOutcome::TimedOut);
            }
            WaitOutcome::Cancelled => return Ok(RelayOutcome::Cancelled),
        };

        let receipt = match self
            .claim_when_ready(&voucher, claimable_at, timeout, cancel)
            .await?
        {
            WaitOutcome::Ready(receipt) => receipt,
            WaitOutcome::TimedOut => return Ok(RelayOutcome::TimedOut),
            WaitOutcome::Cancelled => return Ok(RelayOutcome::Cancelled),
        };
        let payout = receipt
            .events
            .iter()
            .find_map(|e| match e.event {
                ProtocolEvent::FundsClaimed { payout, .. } => Some(payout),
                _ => None,
            })
            .unwrap_or_default();

        info!(voucher_id = %voucher.voucher_id, payout, "relay complete");
        Ok(RelayOutcome::Claimed {
            voucher_id: voucher.voucher_id,
            payout,
        })
    }
}
