//! Read-only replica of the hub stake registry, as seen by one execution chain.
//!
//! Refreshed only by `StakeSnapshot` messages. Slashes decided locally lower
//! the relayer's effective stake at once and stay pending until a snapshot
//! reports them as settled on the hub.

use std::collections::{BTreeMap, HashMap};

use vrelay_types::{Address, Amount, ChainId, Hash32, RelayError, Result, StakeSnapshot};

#[derive(Debug, Clone)]
struct RelayerView {
    snapshot: StakeSnapshot,
    pending_slashes: BTreeMap<Hash32, Amount>,
}

#[derive(Debug, Clone, Default)]
pub struct StakeView {
    relayers: HashMap<Address, RelayerView>,
}

impl StakeView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a snapshot. Returns false for stale or repeated sequences.
    pub fn apply(&mut self, snapshot: StakeSnapshot) -> bool {
        match self.relayers.get_mut(&snapshot.relayer) {
            Some(view) if view.snapshot.sequence >= snapshot.sequence => false,
            Some(view) => {
                view.pending_slashes
                    .retain(|voucher_id, _| !snapshot.settled_slashes.contains(voucher_id));
                view.snapshot = snapshot;
                true
            }
            None => {
                self.relayers.insert(
                    snapshot.relayer,
                    RelayerView {
                        snapshot,
                        pending_slashes: BTreeMap::new(),
                    },
                );
                true
            }
        }
    }

    pub fn snapshot(&self, relayer: &Address) -> Option<&StakeSnapshot> {
        self.relayers.get(relayer).map(|v| &v.snapshot)
    }

    /// Record a locally decided slash that the hub has not settled yet.
    pub fn record_slash(&mut self, relayer: &Address, voucher_id: Hash32, penalty: Amount) {
        if let Some(view) = self.relayers.get_mut(relayer) {
            if !view.snapshot.settled_slashes.contains(&voucher_id) {
                view.pending_slashes.insert(voucher_id, penalty);
            }
        }
    }

    /// Snapshot stake minus pending local penalties.
    pub fn effective_stake(&self, relayer: &Address) -> Amount {
        self.relayers.get(relayer).map_or(0, |view| {
            let pending = view
                .pending_slashes
                .values()
                .fold(0 as Amount, |acc, p| acc.saturating_add(*p));
            view.snapshot.staked_amount.saturating_sub(pending)
        })
    }

    /// Whether `relayer` may take a new voucher towards `destination_chain_id`.
    pub fn ensure_eligible(
        &self,
        relayer: &Address,
        destination_chain_id: ChainId,
        minimum_stake: Amount,
    ) -> Result<()> {
        let view = self.relayers.get(relayer).ok_or_else(|| {
            RelayError::Authorization(format!("relayer {} has no stake on record", relayer))
        })?;
        if !view.snapshot.is_active {
            return Err(RelayError::Authorization(format!(
                "relayer {} is not active",
                relayer
            )));
        }
        let effective = self.effective_stake(relayer);
        if effective < minimum_stake {
            return Err(RelayError::Authorization(format!(
                "relayer {} stake {} below minimum {}",
                relayer, effective, minimum_stake
            )));
        }
        if !view.snapshot.supports(destination_chain_id) {
            return Err(RelayError::Authorization(format!(
                "relayer {} does not support chain {}",
                relayer, destination_chain_id
            )));
        }
        Ok(())
    }
}
