//! Requester flow: lock funds in a transfer request, and take them back if no
//! relayer fills it before the deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use vrelay_chain::{ChainCall, Receipt, TxRequest};
use vrelay_ledger::{escrow_address, CreateRequestParams};
use vrelay_types::{
    Address, BlockNumber, ChainId, EventFilter, EventKind, Hash32, LoggedEvent, ProtocolEvent,
    RelayError, Result,
};

use crate::orchestrator::{OperationType, Orchestrator, WaitOutcome};

/// A request as it landed on its source chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRequest {
    pub request_id: Hash32,
    pub source_chain_id: ChainId,
    pub created_block: BlockNumber,
    pub deadline: BlockNumber,
}

pub struct UserAgent {
    account: Address,
    orch: Arc<Orchestrator>,
}

impl UserAgent {
    pub fn new(account: Address, orch: Arc<Orchestrator>) -> Self {
        Self { account, orch }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// Create a request on `source_chain_id`. Token requests first approve the
    /// escrow for `amount + max_fee`.
    #[tracing::instrument(skip_all, fields(source_chain_id = source_chain_id, nonce = params.nonce))]
    pub async fn create_request(
        &self,
        source_chain_id: ChainId,
        params: CreateRequestParams,
    ) -> Result<CreatedRequest> {
        if params.source_token != Address::NATIVE {
            let total = params
                .amount
                .checked_add(params.max_fee)
                .ok_or_else(|| RelayError::Economic("amount + max_fee overflows".into()))?;
            self.orch
                .submit(
                    OperationType::Approve,
                    source_chain_id,
                    TxRequest::new(
                        self.account,
                        ChainCall::Approve {
                            spender: escrow_address(source_chain_id),
                            token: params.source_token,
                            amount: total,
                        },
                    ),
                )
                .await?;
        }

        let receipt = self
            .orch
            .submit(
                OperationType::CreateRequest,
                source_chain_id,
                TxRequest::new(self.account, ChainCall::CreateRequest(params)),
            )
            .await?;

        let created = receipt
            .events
            .iter()
            .find_map(|e| match e.event {
                ProtocolEvent::RequestCreated {
                    request_id,
                    deadline,
                    created_block,
                    ..
                } => Some(CreatedRequest {
                    request_id,
                    source_chain_id,
                    created_block,
                    deadline,
                }),
                _ => None,
            })
            .ok_or_else(|| RelayError::Other("receipt carries no RequestCreated event".into()))?;

        info!(request_id = %created.request_id, deadline = created.deadline, "request created");
        Ok(created)
    }

    /// Wait for a relayer to take the request.
    pub async fn wait_for_voucher(
        &self,
        request: &CreatedRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome<LoggedEvent>> {
        self.orch
            .wait_for_event(
                request.source_chain_id,
                EventFilter::kind(EventKind::VoucherIssued).with_request(request.request_id),
                request.created_block,
                timeout,
                cancel,
            )
            .await
    }

    /// Wait out the deadline, then refund. A request filled in the meantime
    /// makes the refund fail with a precondition error.
    #[tracing::instrument(skip_all, fields(request_id = %request.request_id))]
    pub async fn refund_when_expired(
        &self,
        request: &CreatedRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome<Receipt>> {
        match self
            .orch
            .wait_for_block(request.source_chain_id, request.deadline + 1, timeout, cancel)
            .await?
        {
            WaitOutcome::Ready(_) => {}
            WaitOutcome::TimedOut => return Ok(WaitOutcome::TimedOut),
            WaitOutcome::Cancelled => return Ok(WaitOutcome::Cancelled),
        }

        let receipt = self
            .orch
            .submit(
                OperationType::Refund,
                request.source_chain_id,
                TxRequest::new(
                    self.account,
                    ChainCall::RefundExpired {
                        request_id: request.request_id,
                    },
                ),
            )
            .await?;
        info!(request_id = %request.request_id, "request refunded");
        Ok(WaitOutcome::Ready(receipt))
    }
}
