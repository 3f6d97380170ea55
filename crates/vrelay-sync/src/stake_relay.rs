//! Cross-chain stake messaging.
//!
//! Execution chains never read the hub directly. A trusted operator carries
//! `StakeSnapshotPublished` events from the hub to every execution chain and
//! `VoucherSlashed` events from each execution chain back to the hub as slash
//! reports. Both targets ignore repeats, so a pass may be replayed safely.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vrelay_chain::{ChainCall, ChainClient, TxRequest};
use vrelay_types::{
    Address, BlockNumber, ChainId, EventFilter, EventKind, LoggedEvent, ProtocolEvent, Result,
    SlashReport, StakeSnapshot,
};

/// Counters for one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Snapshot submissions, one per (snapshot, execution chain).
    pub snapshots_forwarded: usize,
    pub slash_reports_forwarded: usize,
    /// Messages the target rejected for good.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct LogCursor {
    next_block: BlockNumber,
    last_log_index: Option<u64>,
}

impl LogCursor {
    fn advance(&mut self, head: BlockNumber, events: &[LoggedEvent]) {
        // the head block may still grow; read it again next time
        self.next_block = head;
        if let Some(last) = events.last() {
            self.last_log_index = Some(last.log_index);
        }
    }
}

pub struct StakeRelay {
    hub: Arc<dyn ChainClient>,
    executions: Vec<Arc<dyn ChainClient>>,
    operator: Address,
    cursors: Mutex<HashMap<ChainId, LogCursor>>,
}

impl StakeRelay {
    pub fn new(
        hub: Arc<dyn ChainClient>,
        executions: Vec<Arc<dyn ChainClient>>,
        operator: Address,
    ) -> Self {
        Self {
            hub,
            executions,
            operator,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Forward everything published since the last pass.
    ///
    /// Slash reports go first so the snapshots they cause on the hub reach
    /// the execution chains in the same pass. A retryable failure aborts the
    /// pass without moving that chain's cursor.
    pub async fn relay_once(&self) -> Result<RelayStats> {
        let mut cursors = self.cursors.lock().await;
        let mut stats = RelayStats::default();

        for chain in &self.executions {
            let chain_id = chain.chain_id();
            let mut cursor = cursors.get(&chain_id).copied().unwrap_or_default();
            let (head, events) = fetch_new(
                chain.as_ref(),
                &EventFilter::kind(EventKind::VoucherSlashed),
                &cursor,
            )
            .await?;

            for logged in &events {
                if let ProtocolEvent::VoucherSlashed {
                    voucher_id,
                    relayer,
                    penalty,
                    ..
                } = &logged.event
                {
                    let report = SlashReport {
                        voucher_id: *voucher_id,
                        relayer: *relayer,
                        penalty: *penalty,
                        chain_id,
                    };
                    if self
                        .forward(self.hub.as_ref(), ChainCall::ApplySlashReport(report))
                        .await?
                    {
                        stats.slash_reports_forwarded += 1;
                    } else {
                        stats.rejected += 1;
                    }
                }
            }
            cursor.advance(head, &events);
            cursors.insert(chain_id, cursor);
        }

        let hub_id = self.hub.chain_id();
        let mut cursor = cursors.get(&hub_id).copied().unwrap_or_default();
        let (head, events) = fetch_new(
            self.hub.as_ref(),
            &EventFilter::kind(EventKind::StakeSnapshotPublished),
            &cursor,
        )
        .await?;

        for snapshot in latest_snapshots(&events).into_values() {
            for chain in &self.executions {
                if self
                    .forward(chain.as_ref(), ChainCall::ApplyStakeSnapshot(snapshot.clone()))
                    .await?
                {
                    stats.snapshots_forwarded += 1;
                } else {
                    stats.rejected += 1;
                }
            }
        }
        cursor.advance(head, &events);
        cursors.insert(hub_id, cursor);

        if stats.snapshots_forwarded + stats.slash_reports_forwarded > 0 {
            info!(
                snapshots = stats.snapshots_forwarded,
                slash_reports = stats.slash_reports_forwarded,
                rejected = stats.rejected,
                "stake messages relayed"
            );
        }
        Ok(stats)
    }

    /// Relay every `poll` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken, poll: Duration) {
        loop {
            if let Err(e) = self.relay_once().await {
                warn!(error = %e, "stake relay pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Ok(false) when the target rejected the message for good.
    async fn forward(&self, target: &dyn ChainClient, call: ChainCall) -> Result<bool> {
        let name = call.name();
        match target.submit(TxRequest::new(self.operator, call)).await {
            Ok(receipt) => {
                debug!(
                    chain_id = target.chain_id(),
                    call = name,
                    block = receipt.block_number,
                    "stake message delivered"
                );
                Ok(true)
            }
            Err(e) if e.kind().is_retryable() => Err(e),
            Err(e) => {
                warn!(chain_id = target.chain_id(), call = name, error = %e, "stake message rejected");
                Ok(false)
            }
        }
    }
}

async fn fetch_new(
    chain: &dyn ChainClient,
    filter: &EventFilter,
    cursor: &LogCursor,
) -> Result<(BlockNumber, Vec<LoggedEvent>)> {
    let head = chain.block_number().await?;
    if head < cursor.next_block {
        return Ok((cursor.next_block, Vec::new()));
    }
    let events = chain
        .events(filter, cursor.next_block, head)
        .await?
        .into_iter()
        .filter(|e| cursor.last_log_index.map_or(true, |i| e.log_index > i))
        .collect();
    Ok((head, events))
}

/// Only the newest snapshot per relayer matters; targets drop older sequences anyway.
fn latest_snapshots(events: &[LoggedEvent]) -> BTreeMap<Address, StakeSnapshot> {
    let mut latest: BTreeMap<Address, StakeSnapshot> = BTreeMap::new();
    for logged in events {
        if let ProtocolEvent::StakeSnapshotPublished(snapshot) = &logged.event {
            let newer = latest
                .get(&snapshot.relayer)
                .map_or(true, |s| snapshot.sequence > s.sequence);
            if newer {
                latest.insert(snapshot.relayer, snapshot.clone());
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrelay_chain::{LocalChain, LocalChainConfig};
    use vrelay_crypto::{ids, sign_digest, KeyPair};
    use vrelay_ledger::{CreateRequestParams, IssueVoucherParams, SlashEvidence};
    use vrelay_types::{Amount, Hash32, ProtocolParams};

    const ETH: Amount = 1_000_000_000_000_000_000;
    const HUB: ChainId = 100;
    const SRC: ChainId = 1;
    const DST: ChainId = 2;

    struct Net {
        hub: LocalChain,
        exec: LocalChain,
        relay: StakeRelay,
        relayer: KeyPair,
    }

    fn params() -> ProtocolParams {
        ProtocolParams {
            minimum_stake: 10 * ETH,
            slash_penalty: ETH,
            delivery_window_blocks: 50,
            ..Default::default()
        }
    }

    async fn net() -> Net {
        let hub = LocalChain::new(LocalChainConfig::hub(HUB, params())).unwrap();
        let exec = LocalChain::new(LocalChainConfig::execution(SRC, params(), [DST])).unwrap();
        let operator = Address::repeat_byte(0x0b);
        hub.add_sync_operator(operator).unwrap();
        exec.add_sync_operator(operator).unwrap();

        let relayer = KeyPair::from_seed("stake relay test relayer", None).unwrap();
        hub.mint(relayer.address(), Address::NATIVE, 50 * ETH).unwrap();
        hub.submit(TxRequest::new(
            relayer.address(),
            ChainCall::Register {
                supported_chains: [SRC, DST].into_iter().collect(),
                stake: 20 * ETH,
            },
        ))
        .await
        .unwrap();

        let relay = StakeRelay::new(
            Arc::new(hub.clone()),
            vec![Arc::new(exec.clone()) as Arc<dyn ChainClient>],
            operator,
        );
        Net {
            hub,
            exec,
            relay,
            relayer,
        }
    }

    async fn issue_and_time_out(net: &Net) -> Hash32 {
        let requester = Address::repeat_byte(0x11);
        net.exec.mint(requester, Address::NATIVE, 10 * ETH).unwrap();
        let receipt = net
            .exec
            .submit(TxRequest::new(
                requester,
                ChainCall::CreateRequest(CreateRequestParams {
                    source_token: Address::NATIVE,
                    destination_token: Address::NATIVE,
                    amount: ETH,
                    destination_chain_id: DST,
                    recipient: Address::repeat_byte(0x22),
                    gas_on_destination: 0,
                    max_fee: ETH / 10,
                    fee_increment: ETH / 100,
                    deadline: 500,
                    nonce: 1,
                }),
            ))
            .await
            .unwrap();
        let request_id = receipt.events[0].event.request_id().unwrap();

        let commitment = ids::voucher_commitment(
            &request_id,
            &net.relayer.address(),
            ETH,
            0,
            DST,
        );
        let receipt = net
            .exec
            .submit(TxRequest::new(
                net.relayer.address(),
                ChainCall::IssueVoucher(IssueVoucherParams {
                    request_id,
                    relayer: net.relayer.address(),
                    fee: 0,
                    signature: sign_digest(&net.relayer, &commitment).unwrap(),
                }),
            ))
            .await
            .unwrap();
        let voucher_id = receipt.events[0].event.voucher_id().unwrap();

        net.exec.advance_blocks(50).unwrap();
        net.exec
            .submit(TxRequest::new(
                Address::repeat_byte(0x33),
                ChainCall::Slash {
                    voucher_id,
                    evidence: SlashEvidence::DeliveryTimeout,
                },
            ))
            .await
            .unwrap();
        voucher_id
    }

    #[tokio::test]
    async fn test_snapshot_reaches_execution_chain_once() {
        let net = net().await;
        let relayer = net.relayer.address();
        assert!(net
            .exec
            .with_ledger(|l| l.stake_view().ensure_eligible(&relayer, DST, 10 * ETH))
            .unwrap()
            .is_err());

        let stats = net.relay.relay_once().await.unwrap();
        assert_eq!(stats.snapshots_forwarded, 1);
        net.exec
            .with_ledger(|l| l.stake_view().ensure_eligible(&relayer, DST, 10 * ETH))
            .unwrap()
            .unwrap();

        let stats = net.relay.relay_once().await.unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_only_latest_snapshot_is_forwarded() {
        let net = net().await;
        net.hub
            .submit(TxRequest::new(
                net.relayer.address(),
                ChainCall::AddStake { amount: ETH },
            ))
            .await
            .unwrap();

        let stats = net.relay.relay_once().await.unwrap();
        assert_eq!(stats.snapshots_forwarded, 1);
        let relayer = net.relayer.address();
        let seen = net
            .exec
            .with_ledger(|l| l.stake_view().snapshot(&relayer).map(|s| s.sequence))
            .unwrap();
        assert_eq!(seen, Some(2));
    }

    #[tokio::test]
    async fn test_slash_is_settled_on_hub_and_reflected_back() {
        let net = net().await;
        let relayer = net.relayer.address();
        net.relay.relay_once().await.unwrap();

        let voucher_id = issue_and_time_out(&net).await;
        assert_eq!(
            net.exec
                .with_ledger(|l| l.stake_view().effective_stake(&relayer))
                .unwrap(),
            19 * ETH
        );

        let stats = net.relay.relay_once().await.unwrap();
        assert_eq!(stats.slash_reports_forwarded, 1);
        assert_eq!(stats.snapshots_forwarded, 1);

        let stake = net
            .hub
            .with_registry(|r| r.get(&relayer).cloned())
            .unwrap()
            .unwrap();
        assert_eq!(stake.staked_amount, 19 * ETH);
        assert!(stake.settled_slashes.contains_key(&voucher_id));

        // settled on the hub, so no longer pending locally
        let snapshot_stake = net
            .exec
            .with_ledger(|l| {
                (
                    l.stake_view().effective_stake(&relayer),
                    l.stake_view().snapshot(&relayer).map(|s| s.staked_amount),
                )
            })
            .unwrap();
        assert_eq!(snapshot_stake, (19 * ETH, Some(19 * ETH)));

        assert_eq!(net.relay.relay_once().await.unwrap(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_replay_from_scratch_changes_nothing() {
        let net = net().await;
        let relayer = net.relayer.address();
        net.relay.relay_once().await.unwrap();
        issue_and_time_out(&net).await;
        net.relay.relay_once().await.unwrap();

        let fresh = StakeRelay::new(
            Arc::new(net.hub.clone()),
            vec![Arc::new(net.exec.clone()) as Arc<dyn ChainClient>],
            Address::repeat_byte(0x0b),
        );
        fresh.relay_once().await.unwrap();

        let staked = net
            .hub
            .with_registry(|r| r.get(&relayer).map(|s| s.staked_amount))
            .unwrap();
        assert_eq!(staked, Some(19 * ETH));
        assert_eq!(
            net.exec
                .with_ledger(|l| l.stake_view().effective_stake(&relayer))
                .unwrap(),
            19 * ETH
        );
    }

    #[tokio::test]
    async fn test_unauthorized_operator_is_counted_as_rejected() {
        let net = net().await;
        let rogue = StakeRelay::new(
            Arc::new(net.hub.clone()),
            vec![Arc::new(net.exec.clone()) as Arc<dyn ChainClient>],
            Address::repeat_byte(0x0c),
        );
        let stats = rogue.relay_once().await.unwrap();
        assert_eq!(stats.snapshots_forwarded, 0);
        assert_eq!(stats.rejected, 1);
    }
}
