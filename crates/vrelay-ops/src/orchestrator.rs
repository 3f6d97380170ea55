//! Chain access for the agents: retried reads, recorded submissions, and the
//! two suspension points (an event appearing, a block height being reached).
//!
//! A wait ends in [`WaitOutcome::TimedOut`] or [`WaitOutcome::Cancelled`]
//! without side effects; neither is an error.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vrelay_chain::{ChainCall, ChainClient, Receipt, TxRequest};
use vrelay_merkle::MultiChainBatch;
use vrelay_store::{EventStore, OperationStatus, StoredOperation};
use vrelay_sync::{StakeRelay, SyncConfig, SyncEngine};
use vrelay_types::{
    Address, BlockNumber, ChainId, ErrorKind, EventFilter, LoggedEvent, RelayError, Result,
};

use crate::config::{OrchestratorConfig, RetryPolicy};

/// How a suspension point ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

impl<T> WaitOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            WaitOutcome::Ready(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WaitOutcome<U> {
        match self {
            WaitOutcome::Ready(v) => WaitOutcome::Ready(f(v)),
            WaitOutcome::TimedOut => WaitOutcome::TimedOut,
            WaitOutcome::Cancelled => WaitOutcome::Cancelled,
        }
    }
}

/// Operation type for tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Stake,
    CreateRequest,
    Approve,
    Refund,
    IssueVoucher,
    Deliver,
    MarkFulfilled,
    Claim,
    Challenge,
    Slash,
    BatchLeaf,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Stake => "stake",
            OperationType::CreateRequest => "create_request",
            OperationType::Approve => "approve",
            OperationType::Refund => "refund",
            OperationType::IssueVoucher => "issue_voucher",
            OperationType::Deliver => "deliver",
            OperationType::MarkFulfilled => "mark_fulfilled",
            OperationType::Claim => "claim",
            OperationType::Challenge => "challenge",
            OperationType::Slash => "slash",
            OperationType::BatchLeaf => "batch_leaf",
        }
    }
}

/// Run `fut` unless `cancel` fires or `deadline` passes first. Cancellation
/// wins ties.
async fn bounded<T>(
    deadline: tokio::time::Instant,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<WaitOutcome<T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Ok(WaitOutcome::TimedOut),
        out = fut => out.map(WaitOutcome::Ready),
    }
}

/// Retry `op` on transport failures with capped exponential backoff.
///
/// Protocol rejections are returned at once: repeating the same call cannot
/// change the outcome.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == ErrorKind::Transport && attempt + 1 < attempts => {
                let delay = policy.delay(attempt);
                warn!(what, attempt = attempt + 1, ?delay, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Shared by every agent in a process.
pub struct Orchestrator {
    chains: BTreeMap<ChainId, Arc<dyn ChainClient>>,
    retry: RetryPolicy,
    poll_interval: Duration,
    event_timeout: Duration,
    store: Option<Arc<dyn EventStore>>,
    op_seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(retry: RetryPolicy, poll_interval: Duration, event_timeout: Duration) -> Self {
        Self {
            chains: BTreeMap::new(),
            retry,
            poll_interval,
            event_timeout,
            store: None,
            op_seq: AtomicU64::new(0),
        }
    }

    /// Gateway clients for every configured chain.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let mut orch = Self::new(
            config.retry.clone(),
            config.poll_interval(),
            config.event_timeout(),
        );
        for client in config.gateway_clients() {
            orch = orch.with_chain(client);
        }
        Ok(orch)
    }

    pub fn with_chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chains.insert(chain.chain_id(), chain);
        self
    }

    /// Record every submission in `store`.
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_timeout(&self) -> Duration {
        self.event_timeout
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.keys().copied().collect()
    }

    pub fn chain(&self, chain_id: ChainId) -> Result<&Arc<dyn ChainClient>> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| RelayError::Config(format!("chain {} is not configured", chain_id)))
    }

    pub async fn block_number(&self, chain_id: ChainId) -> Result<BlockNumber> {
        let chain = self.chain(chain_id)?;
        with_retry(&self.retry, "block_number", || chain.block_number()).await
    }

    pub async fn events(
        &self,
        chain_id: ChainId,
        filter: &EventFilter,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LoggedEvent>> {
        let chain = self.chain(chain_id)?;
        with_retry(&self.retry, "events", || chain.events(filter, from, to)).await
    }

    /// Matching events from `from` up to the current head.
    pub async fn history(
        &self,
        chain_id: ChainId,
        filter: &EventFilter,
        from: BlockNumber,
    ) -> Result<Vec<LoggedEvent>> {
        let head = self.block_number(chain_id).await?;
        if head < from {
            return Ok(Vec::new());
        }
        self.events(chain_id, filter, from, head).await
    }

    /// First matching event in the whole log.
    pub async fn find_event(
        &self,
        chain_id: ChainId,
        filter: &EventFilter,
    ) -> Result<Option<LoggedEvent>> {
        Ok(self.history(chain_id, filter, 0).await?.into_iter().next())
    }

    /// Submit once and record the operation. Rejections come back verbatim.
    pub async fn submit(
        &self,
        op_type: OperationType,
        chain_id: ChainId,
        tx: TxRequest,
    ) -> Result<Receipt> {
        let chain = self.chain(chain_id)?;
        let seq = self.op_seq.fetch_add(1, Ordering::Relaxed);
        let mut op = StoredOperation {
            id: format!("{}-{}-{}", chain_id, op_type.as_str(), seq),
            chain_id,
            op_type: op_type.as_str().to_string(),
            status: OperationStatus::Submitted,
            tx_hash: None,
            created_at: unix_now(),
            updated_at: unix_now(),
            error: None,
            data: serde_json::to_string(&tx)?,
        };
        self.record(&op).await;

        let result = chain.submit(tx).await;
        op.updated_at = unix_now();
        match &result {
            Ok(receipt) => {
                op.status = OperationStatus::Confirmed;
                op.tx_hash = Some(receipt.tx_hash);
                debug!(chain_id, op = op_type.as_str(), block = receipt.block_number, "submitted");
            }
            Err(e) => {
                op.status = OperationStatus::Failed;
                op.error = Some(e.to_string());
                debug!(chain_id, op = op_type.as_str(), error = %e, "rejected");
            }
        }
        self.record(&op).await;
        result
    }

    async fn record(&self, op: &StoredOperation) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_operation(op).await {
                warn!(id = %op.id, error = %e, "failed to record operation");
            }
        }
    }

    /// Wait for the first event matching `filter` at or after block `from`.
    ///
    /// Subscribes before scanning history so an event landing in between is
    /// not missed.
    #[tracing::instrument(skip_all, fields(chain_id = chain_id, from = from))]
    pub async fn wait_for_event(
        &self,
        chain_id: ChainId,
        filter: EventFilter,
        from: BlockNumber,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome<LoggedEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let chain = self.chain(chain_id)?;
        let setup = async {
            let live =
                with_retry(&self.retry, "subscribe", || chain.subscribe(filter.clone())).await?;
            let past = self.history(chain_id, &filter, from).await?;
            Ok::<_, RelayError>((live, past.into_iter().next()))
        };
        let mut live = match bounded(deadline, cancel, setup).await? {
            WaitOutcome::Ready((_, Some(found))) => return Ok(WaitOutcome::Ready(found)),
            WaitOutcome::Ready((live, None)) => live,
            WaitOutcome::TimedOut => {
                debug!(chain_id, ?timeout, "event wait timed out");
                return Ok(WaitOutcome::TimedOut);
            }
            WaitOutcome::Cancelled => return Ok(WaitOutcome::Cancelled),
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(chain_id, ?timeout, "event wait timed out");
                    return Ok(WaitOutcome::TimedOut);
                }
                next = live.next() => match next {
                    Some(event) if event.block_number >= from => return Ok(WaitOutcome::Ready(event)),
                    Some(_) => continue,
                    None => {
                        return Err(RelayError::Transport(format!(
                            "event subscription on chain {} closed",
                            chain_id
                        )))
                    }
                },
            }
        }
    }

    /// Wait until chain `chain_id` reaches `target`.
    #[tracing::instrument(skip_all, fields(chain_id = chain_id, target = target))]
    pub async fn wait_for_block(
        &self,
        chain_id: ChainId,
        target: BlockNumber,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome<BlockNumber>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut height = None;
        loop {
            let now = match bounded(deadline, cancel, self.block_number(chain_id)).await? {
                WaitOutcome::Ready(now) => now,
                WaitOutcome::TimedOut => {
                    debug!(chain_id, target, ?height, "block wait timed out");
                    return Ok(WaitOutcome::TimedOut);
                }
                WaitOutcome::Cancelled => return Ok(WaitOutcome::Cancelled),
            };
            if now >= target {
                return Ok(WaitOutcome::Ready(now));
            }
            height = Some(now);
            match bounded(deadline, cancel, async {
                tokio::time::sleep(self.poll_interval).await;
                Ok::<_, RelayError>(())
            })
            .await?
            {
                WaitOutcome::Ready(()) => {}
                WaitOutcome::TimedOut => {
                    debug!(chain_id, target, ?height, "block wait timed out");
                    return Ok(WaitOutcome::TimedOut);
                }
                WaitOutcome::Cancelled => return Ok(WaitOutcome::Cancelled),
            }
        }
    }

    /// Hand each leaf of a signed batch to its own chain's executor.
    ///
    /// Chains act independently: one chain rejecting its leaf does not undo
    /// another's. Results are keyed by chain, leaves in batch order.
    pub async fn execute_batch(
        &self,
        submitter: Address,
        batch: &MultiChainBatch,
    ) -> BTreeMap<ChainId, Vec<Result<Receipt>>> {
        let mut results = BTreeMap::new();
        for chain_id in batch.chains() {
            let mut receipts = Vec::new();
            for leaf in batch.leaves_for_chain(chain_id) {
                receipts.push(
                    self.submit(
                        OperationType::BatchLeaf,
                        chain_id,
                        TxRequest::new(submitter, ChainCall::ExecuteBatchLeaf(leaf)),
                    )
                    .await,
                );
            }
            results.insert(chain_id, receipts);
        }
        info!(root = %batch.merkle_root, chains = results.len(), "batch fanned out");
        results
    }

    /// Stake relay between `hub` and every other configured chain.
    pub fn stake_relay(&self, hub: ChainId, operator: Address) -> Result<StakeRelay> {
        let hub_client = self.chain(hub)?.clone();
        let executions = self
            .chains
            .iter()
            .filter(|(id, _)| **id != hub)
            .map(|(_, c)| c.clone())
            .collect();
        Ok(StakeRelay::new(hub_client, executions, operator))
    }

    /// Observer sync over every configured chain into `store`.
    pub fn sync_engine(&self, config: SyncConfig, store: Arc<dyn EventStore>) -> SyncEngine {
        SyncEngine::new(config, self.chains.values().cloned().collect(), store, None)
    }
}
