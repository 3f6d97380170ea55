//! In-process chain: a serialized transaction log over the hub registry or an
//! execution ledger, with a manually advanced block clock.
//!
//! Each call runs against a copy of the chain state that replaces the original
//! only on success, so a rejected call has no effect. Calls are applied one at
//! a time; two racing submissions are ordered by whoever takes the lock first.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use vrelay_crypto::Encoder;
use vrelay_ledger::{AssetBook, ExecutionLedger};
use vrelay_merkle::{BatchVerifier, SignedLeaf};
use vrelay_stake::StakeRegistry;
use vrelay_types::{
    Address, Amount, BlockNumber, ChainId, EventFilter, Hash32, LoggedEvent, ProtocolEvent,
    ProtocolParams, RelayError, Result, Timestamp,
};

use crate::{ChainCall, ChainClient, EventSubscription, Receipt, TxRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRole {
    Hub,
    Execution,
}

#[derive(Debug, Clone)]
pub struct LocalChainConfig {
    pub chain_id: ChainId,
    pub role: ChainRole,
    pub params: ProtocolParams,
    /// Destinations an execution chain accepts requests for. Unused on the hub.
    pub supported_destinations: BTreeSet<ChainId>,
    pub genesis_time: Timestamp,
    pub block_time_secs: u64,
}

impl LocalChainConfig {
    pub fn hub(chain_id: ChainId, params: ProtocolParams) -> Self {
        Self {
            chain_id,
            role: ChainRole::Hub,
            params,
            supported_destinations: BTreeSet::new(),
            genesis_time: 1_700_000_000,
            block_time_secs: 12,
        }
    }

    pub fn execution(
        chain_id: ChainId,
        params: ProtocolParams,
        supported_destinations: impl IntoIterator<Item = ChainId>,
    ) -> Self {
        Self {
            supported_destinations: supported_destinations.into_iter().collect(),
            role: ChainRole::Execution,
            ..Self::hub(chain_id, params)
        }
    }
}

/// Protocol account of a chain. Batch leaves targeting it carry a JSON `ChainCall`.
pub fn protocol_address(chain_id: ChainId) -> Address {
    derived_account("vrelay.protocol.v1", chain_id)
}

fn derived_account(tag: &str, chain_id: ChainId) -> Address {
    let hash = Encoder::new().tag(tag).u64(chain_id).keccak();
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash.as_bytes()[12..]);
    Address(out)
}

#[derive(Debug, Clone)]
struct HubState {
    registry: StakeRegistry,
    assets: AssetBook,
    vault: Address,
}

#[derive(Debug, Clone)]
enum Runtime {
    Hub(HubState),
    Execution(ExecutionLedger),
}

impl Runtime {
    fn assets_mut(&mut self) -> &mut AssetBook {
        match self {
            Runtime::Hub(hub) => &mut hub.assets,
            Runtime::Execution(ledger) => ledger.assets_mut(),
        }
    }

    fn assets(&self) -> &AssetBook {
        match self {
            Runtime::Hub(hub) => &hub.assets,
            Runtime::Execution(ledger) => ledger.assets(),
        }
    }
}

/// The part of a chain that a call may change.
#[derive(Debug, Clone)]
struct Machine {
    chain_id: ChainId,
    genesis_time: Timestamp,
    block_time_secs: u64,
    height: BlockNumber,
    runtime: Runtime,
    batches: BatchVerifier,
    sync_operators: BTreeSet<Address>,
}

impl Machine {
    fn timestamp(&self) -> Timestamp {
        self.genesis_time
            .saturating_add(self.height.saturating_mul(self.block_time_secs))
    }

    fn ensure_sync_operator(&self, from: &Address) -> Result<()> {
        if !self.sync_operators.contains(from) {
            return Err(RelayError::Authorization(format!(
                "{} may not relay stake messages to chain {}",
                from, self.chain_id
            )));
        }
        Ok(())
    }

    fn execute(&mut self, from: Address, call: ChainCall) -> Result<Vec<ProtocolEvent>> {
        if matches!(
            call,
            ChainCall::ApplyStakeSnapshot(_) | ChainCall::ApplySlashReport(_)
        ) {
            self.ensure_sync_operator(&from)?;
        }
        let call = match call {
            ChainCall::ExecuteBatchLeaf(leaf) => return self.execute_leaf(leaf),
            other => other,
        };
        let (now, ts) = (self.height, self.timestamp());

        match (&mut self.runtime, call) {
            (Runtime::Execution(ledger), ChainCall::CreateRequest(p)) => {
                Ok(ledger.create_request(from, p, now)?.1)
            }
            (
                Runtime::Execution(ledger),
                ChainCall::Approve {
                    spender,
                    token,
                    amount,
                },
            ) => {
                ledger.assets_mut().approve(from, spender, token, amount);
                Ok(Vec::new())
            }
            (Runtime::Execution(ledger), ChainCall::IssueVoucher(p)) => {
                Ok(ledger.issue_voucher(p, now)?.1)
            }
            (Runtime::Execution(ledger), ChainCall::DeliverVoucher(d)) => {
                ledger.deliver_voucher(from, d, now)
            }
            (
                Runtime::Execution(ledger),
                ChainCall::MarkFulfilled {
                    attestation,
                    signature,
                },
            ) => ledger.mark_fulfilled(&attestation, &signature, now),
            (Runtime::Execution(ledger), ChainCall::ClaimSourceFunds { voucher_id }) => {
                ledger.claim_source_funds(&voucher_id, now)
            }
            (
                Runtime::Execution(ledger),
                ChainCall::Slash {
                    voucher_id,
                    evidence,
                },
            ) => ledger.slash(&voucher_id, &evidence, now),
            (Runtime::Execution(ledger), ChainCall::RefundExpired { request_id }) => {
                ledger.refund_expired(&request_id, now)
            }
            (Runtime::Execution(ledger), ChainCall::ApplyStakeSnapshot(snapshot)) => {
                Ok(ledger.apply_stake_snapshot(snapshot))
            }

            (
                Runtime::Hub(hub),
                ChainCall::Register {
                    supported_chains,
                    stake,
                },
            ) => {
                hub.assets
                    .transfer(&from, &hub.vault, &Address::NATIVE, stake)?;
                hub.registry.register(from, supported_chains, stake, ts)
            }
            (Runtime::Hub(hub), ChainCall::AddStake { amount }) => {
                hub.assets
                    .transfer(&from, &hub.vault, &Address::NATIVE, amount)?;
                hub.registry.add_stake(from, amount, ts)
            }
            (Runtime::Hub(hub), ChainCall::SetSupportedChains { supported_chains }) => {
                hub.registry.set_supported_chains(from, supported_chains, ts)
            }
            (Runtime::Hub(hub), ChainCall::StartUnbonding { amount }) => {
                hub.registry.start_unbonding(from, amount, ts)
            }
            (Runtime::Hub(hub), ChainCall::CompleteUnbonding) => {
                let (payout, events) = hub.registry.complete_unbonding(from, ts)?;
                hub.assets
                    .transfer(&hub.vault, &payout.to, &Address::NATIVE, payout.amount)?;
                Ok(events)
            }
            (Runtime::Hub(hub), ChainCall::ApplySlashReport(report)) => {
                hub.registry.apply_slash(&report, ts)
            }

            (runtime, call) => Err(RelayError::Validation(format!(
                "call `{}` is not available on {} chain {}",
                call.name(),
                match runtime {
                    Runtime::Hub(_) => "hub",
                    Runtime::Execution(_) => "execution",
                },
                self.chain_id
            ))),
        }
    }

    fn execute_leaf(&mut self, leaf: SignedLeaf) -> Result<Vec<ProtocolEvent>> {
        let leaf_hash = self.batches.authorize(&leaf)?;
        let SignedLeaf {
            operation,
            merkle_root,
            signer,
            ..
        } = leaf;

        let mut events = vec![ProtocolEvent::BatchLeafExecuted {
            root: merkle_root,
            leaf_hash,
            signer,
        }];

        if operation.target == protocol_address(self.chain_id) {
            if operation.value != 0 {
                return Err(RelayError::Validation(
                    "protocol calls in a batch carry no value".into(),
                ));
            }
            let call: ChainCall = serde_json::from_slice(&operation.payload)?;
            if matches!(call, ChainCall::ExecuteBatchLeaf(_)) {
                return Err(RelayError::Validation("batch leaves cannot nest".into()));
            }
            events.extend(self.execute(signer, call)?);
        } else {
            self.runtime.assets_mut().transfer(
                &signer,
                &operation.target,
                &Address::NATIVE,
                operation.value,
            )?;
        }
        Ok(events)
    }
}

struct ChainState {
    machine: Machine,
    logs: Vec<LoggedEvent>,
    tx_count: u64,
}

struct Subscriber {
    filter: EventFilter,
    outbox: mpsc::UnboundedSender<LoggedEvent>,
}

/// Cheap to clone; clones share the same chain.
#[derive(Clone)]
pub struct LocalChain {
    chain_id: ChainId,
    role: ChainRole,
    state: Arc<Mutex<ChainState>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl std::fmt::Debug for LocalChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChain")
            .field("chain_id", &self.chain_id)
            .field("role", &self.role)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| RelayError::Other("local chain lock poisoned".into()))
}

impl LocalChain {
    pub fn new(config: LocalChainConfig) -> Result<Self> {
        config.params.validate()?;
        let runtime = match config.role {
            ChainRole::Hub => Runtime::Hub(HubState {
                registry: StakeRegistry::new(config.params.clone()),
                assets: AssetBook::new(),
                vault: derived_account("vrelay.stake_vault.v1", config.chain_id),
            }),
            ChainRole::Execution => Runtime::Execution(ExecutionLedger::new(
                config.chain_id,
                config.params.clone(),
                config.supported_destinations.clone(),
            )?),
        };
        let machine = Machine {
            chain_id: config.chain_id,
            genesis_time: config.genesis_time,
            block_time_secs: config.block_time_secs,
            height: 0,
            runtime,
            batches: BatchVerifier::new(config.chain_id),
            sync_operators: BTreeSet::new(),
        };
        Ok(Self {
            chain_id: config.chain_id,
            role: config.role,
            state: Arc::new(Mutex::new(ChainState {
                machine,
                logs: Vec::new(),
                tx_count: 0,
            })),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn role(&self) -> ChainRole {
        self.role
    }

    /// Advance the block clock by `n` blocks. Returns the new height.
    pub fn advance_blocks(&self, n: u64) -> Result<BlockNumber> {
        let mut state = lock(&self.state)?;
        state.machine.height = state.machine.height.saturating_add(n);
        Ok(state.machine.height)
    }

    /// Advance the block clock to `height` if it is behind.
    pub fn advance_to(&self, height: BlockNumber) -> Result<BlockNumber> {
        let mut state = lock(&self.state)?;
        state.machine.height = state.machine.height.max(height);
        Ok(state.machine.height)
    }

    pub fn timestamp(&self) -> Result<Timestamp> {
        Ok(lock(&self.state)?.machine.timestamp())
    }

    /// Genesis allocation.
    pub fn mint(&self, owner: Address, token: Address, amount: Amount) -> Result<()> {
        lock(&self.state)?
            .machine
            .runtime
            .assets_mut()
            .mint(owner, token, amount)
    }

    pub fn balance_of(&self, owner: &Address, token: &Address) -> Result<Amount> {
        Ok(lock(&self.state)?
            .machine
            .runtime
            .assets()
            .balance_of(owner, token))
    }

    /// Trust `operator` to relay stake snapshots and slash reports.
    pub fn add_sync_operator(&self, operator: Address) -> Result<()> {
        lock(&self.state)?.machine.sync_operators.insert(operator);
        Ok(())
    }

    pub fn add_attester(&self, attester: Address) -> Result<()> {
        self.with_ledger_mut(|ledger| {
            ledger.attesters_mut().add(attester);
        })
    }

    /// Read the execution ledger.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&ExecutionLedger) -> R) -> Result<R> {
        let state = lock(&self.state)?;
        match &state.machine.runtime {
            Runtime::Execution(ledger) => Ok(f(ledger)),
            Runtime::Hub(_) => Err(RelayError::Other(format!(
                "chain {} is the hub, not an execution chain",
                self.chain_id
            ))),
        }
    }

    fn with_ledger_mut<R>(&self, f: impl FnOnce(&mut ExecutionLedger) -> R) -> Result<R> {
        let mut state = lock(&self.state)?;
        match &mut state.machine.runtime {
            Runtime::Execution(ledger) => Ok(f(ledger)),
            Runtime::Hub(_) => Err(RelayError::Other(format!(
                "chain {} is the hub, not an execution chain",
                self.chain_id
            ))),
        }
    }

    /// Read the hub stake registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&StakeRegistry) -> R) -> Result<R> {
        let state = lock(&self.state)?;
        match &state.machine.runtime {
            Runtime::Hub(hub) => Ok(f(&hub.registry)),
            Runtime::Execution(_) => Err(RelayError::Other(format!(
                "chain {} is an execution chain, not the hub",
                self.chain_id
            ))),
        }
    }

    fn tx_hash(&self, tx_count: u64, tx: &TxRequest) -> Result<Hash32> {
        Ok(Encoder::new()
            .tag("vrelay.tx.v1")
            .u64(self.chain_id)
            .u64(tx_count)
            .address(&tx.from)
            .bytes(&serde_json::to_vec(&tx.call)?)
            .keccak())
    }

    fn publish(&self, events: &[LoggedEvent]) -> Result<()> {
        let mut subscribers = lock(&self.subscribers)?;
        subscribers.retain(|sub| {
            events
                .iter()
                .filter(|e| sub.filter.matches(&e.event))
                .all(|e| sub.outbox.send(e.clone()).is_ok())
        });
        Ok(())
    }
}

#[async_trait]
impl ChainClient for LocalChain {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn block_number(&self) -> Result<BlockNumber> {
        Ok(lock(&self.state)?.machine.height)
    }

    async fn submit(&self, tx: TxRequest) -> Result<Receipt> {
        let mut state = lock(&self.state)?;
        let tx_hash = self.tx_hash(state.tx_count, &tx)?;
        let block_number = state.machine.height;

        let mut next = state.machine.clone();
        let emitted = match next.execute(tx.from, tx.call.clone()) {
            Ok(events) => events,
            Err(e) => {
                debug!(
                    chain_id = self.chain_id,
                    call = tx.call.name(),
                    from = %tx.from,
                    error = %e,
                    "call rejected"
                );
                return Err(e);
            }
        };
        state.machine = next;
        state.tx_count += 1;

        let first_index = state.logs.len() as u64;
        let events: Vec<LoggedEvent> = emitted
            .into_iter()
            .enumerate()
            .map(|(i, event)| LoggedEvent {
                chain_id: self.chain_id,
                block_number,
                tx_hash,
                log_index: first_index + i as u64,
                event,
            })
            .collect();
        state.logs.extend(events.iter().cloned());

        info!(
            chain_id = self.chain_id,
            call = tx.call.name(),
            %tx_hash,
            block_number,
            events = events.len(),
            "call included"
        );

        // published under the state lock so subscribers see log order
        self.publish(&events)?;
        drop(state);

        Ok(Receipt {
            tx_hash,
            block_number,
            events,
        })
    }

    async fn events(
        &self,
        filter: &EventFilter,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LoggedEvent>> {
        let state = lock(&self.state)?;
        Ok(state
            .logs
            .iter()
            .filter(|e| e.block_number >= from && e.block_number <= to)
            .filter(|e| filter.matches(&e.event))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<EventSubscription> {
        let (outbox, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers)?.push(Subscriber { filter, outbox });
        Ok(EventSubscription::from_receiver(receiver))
    }
}
