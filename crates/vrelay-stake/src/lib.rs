//! Relayer stake registry on the hub chain.
//!
//! Tracks each relayer's bonded and unbonding capital and the chains it serves.
//! Every mutation bumps the relayer's sequence number and publishes a
//! `StakeSnapshot`, which execution chains apply on their own schedule.
//!
//! A snapshot lists only the slashes settled in the last
//! [`SETTLED_SLASH_WINDOW`] sequences. The registry itself remembers every
//! settled voucher so a replayed report stays a no-op.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vrelay_types::{
    Address, Amount, ChainId, Hash32, ProtocolEvent, ProtocolParams, RelayError, Result,
    SlashReport, StakeSnapshot, Timestamp,
};

/// How many sequences a settled slash stays listed in published snapshots.
pub const SETTLED_SLASH_WINDOW: u64 = 64;

/// Hub-side stake record of one relayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlpStake {
    /// Bonded stake, net of slashes.
    pub staked_amount: Amount,
    pub unbonding_amount: Amount,
    pub unbonding_start_time: Timestamp,
    /// Cumulative slashed value, kept for audit.
    pub slashed_amount: Amount,
    pub is_active: bool,
    pub registered_at: Timestamp,
    pub supported_chains: BTreeSet<ChainId>,
    pub sequence: u64,
    /// Settled vouchers, with the sequence whose snapshot first listed them.
    pub settled_slashes: BTreeMap<Hash32, u64>,
}

/// Result of a registry call that pays value back out to the relayer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub to: Address,
    pub amount: Amount,
}

#[derive(Debug, Clone)]
pub struct StakeRegistry {
    params: ProtocolParams,
    stakes: HashMap<Address, XlpStake>,
    slashed_pool: Amount,
}

impl StakeRegistry {
    pub fn new(params: ProtocolParams) -> Self {
        Self {
            params,
            stakes: HashMap::new(),
            slashed_pool: 0,
        }
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    pub fn get(&self, relayer: &Address) -> Option<&XlpStake> {
        self.stakes.get(relayer)
    }

    pub fn is_active(&self, relayer: &Address) -> bool {
        self.stakes.get(relayer).is_some_and(|s| s.is_active)
    }

    /// Total value removed from relayers by slashing.
    pub fn slashed_pool(&self) -> Amount {
        self.slashed_pool
    }

    pub fn snapshot(&self, relayer: &Address, now: Timestamp) -> Option<StakeSnapshot> {
        self.stakes.get(relayer).map(|s| StakeSnapshot {
            relayer: *relayer,
            staked_amount: s.staked_amount,
            is_active: s.is_active,
            supported_chains: s.supported_chains.clone(),
            sequence: s.sequence,
            settled_slashes: s
                .settled_slashes
                .iter()
                .filter(|(_, at)| s.sequence.saturating_sub(**at) < SETTLED_SLASH_WINDOW)
                .map(|(voucher_id, _)| *voucher_id)
                .collect(),
            taken_at: now,
        })
    }

    /// Register a relayer with an initial bonded deposit.
    ///
    /// An account may register again only once it has nothing bonded or unbonding.
    pub fn register(
        &mut self,
        relayer: Address,
        supported_chains: BTreeSet<ChainId>,
        stake_amount: Amount,
        now: Timestamp,
    ) -> Result<Vec<ProtocolEvent>> {
        if supported_chains.is_empty() {
            return Err(RelayError::Validation(
                "relayer must support at least one chain".into(),
            ));
        }
        if stake_amount < self.params.minimum_stake {
            return Err(RelayError::Validation(format!(
                "stake {} below minimum {}",
                stake_amount, self.params.minimum_stake
            )));
        }
        let previous = self.stakes.get(&relayer);
        if let Some(existing) = previous {
            if existing.staked_amount > 0 || existing.unbonding_amount > 0 {
                return Err(RelayError::Precondition(format!(
                    "relayer {} already registered",
                    relayer
                )));
            }
        }

        let (sequence, slashed_amount, settled_slashes) = previous
            .map(|s| (s.sequence, s.slashed_amount, s.settled_slashes.clone()))
            .unwrap_or_default();

        self.stakes.insert(
            relayer,
            XlpStake {
                staked_amount: stake_amount,
                unbonding_amount: 0,
                unbonding_start_time: 0,
                slashed_amount,
                is_active: true,
                registered_at: now,
                supported_chains: supported_chains.clone(),
                sequence,
                settled_slashes,
            },
        );

        info!(%relayer, stake = stake_amount, chains = ?supported_chains, "relayer registered");

        let mut events = vec![ProtocolEvent::RelayerRegistered {
            relayer,
            staked_amount: stake_amount,
            supported_chains,
        }];
        events.push(self.publish(&relayer, now)?);
        Ok(events)
    }

    /// Increase bonded stake. Can reactivate a relayer that fell under the minimum.
    pub fn add_stake(
        &mut self,
        relayer: Address,
        amount: Amount,
        now: Timestamp,
    ) -> Result<Vec<ProtocolEvent>> {
        if amount == 0 {
            return Err(RelayError::Validation("amount must be > 0".into()));
        }
        let min = self.params.minimum_stake;
        let stake = self.stake_mut(&relayer)?;
        stake.staked_amount = stake
            .staked_amount
            .checked_add(amount)
            .ok_or_else(|| RelayError::Economic("staked amount overflows".into()))?;
        stake.is_active = stake.staked_amount >= min;

        debug!(%relayer, amount, total = stake.staked_amount, "stake added");

        Ok(vec![
            ProtocolEvent::StakeAdded { relayer, amount },
            self.publish(&relayer, now)?,
        ])
    }

    /// Replace the set of chains the relayer serves.
    pub fn set_supported_chains(
        &mut self,
        relayer: Address,
        supported_chains: BTreeSet<ChainId>,
        now: Timestamp,
    ) -> Result<Vec<ProtocolEvent>> {
        if supported_chains.is_empty() {
            return Err(RelayError::Validation(
                "relayer must support at least one chain".into(),
            ));
        }
        self.stake_mut(&relayer)?.supported_chains = supported_chains;
        Ok(vec![self.publish(&relayer, now)?])
    }

    /// Move `amount` from bonded to unbonding and (re)start the timer.
    pub fn start_unbonding(
        &mut self,
        relayer: Address,
        amount: Amount,
        now: Timestamp,
    ) -> Result<Vec<ProtocolEvent>> {
        if amount == 0 {
            return Err(RelayError::Validation("amount must be > 0".into()));
        }
        let min = self.params.minimum_stake;
        let period = self.params.unbonding_period_secs;
        let stake = self.stake_mut(&relayer)?;
        if amount > stake.staked_amount {
            return Err(RelayError::Validation(format!(
                "cannot unbond {}, only {} bonded",
                amount, stake.staked_amount
            )));
        }
        stake.unbonding_amount = stake
            .unbonding_amount
            .checked_add(amount)
            .ok_or_else(|| RelayError::Economic("unbonding amount overflows".into()))?;
        stake.staked_amount -= amount;
        stake.unbonding_start_time = now;
        stake.is_active = stake.staked_amount >= min;

        let release_at = now.saturating_add(period);
        info!(%relayer, amount, release_at, active = stake.is_active, "unbonding started");

        Ok(vec![
            ProtocolEvent::UnbondingStarted {
                relayer,
                amount,
                release_at,
            },
            self.publish(&relayer, now)?,
        ])
    }

    /// Release the unbonding balance once the unbonding period has elapsed.
    pub fn complete_unbonding(
        &mut self,
        relayer: Address,
        now: Timestamp,
    ) -> Result<(Payout, Vec<ProtocolEvent>)> {
        let period = self.params.unbonding_period_secs;
        let stake = self.stake_mut(&relayer)?;
        if stake.unbonding_amount == 0 {
            return Err(RelayError::Precondition("nothing is unbonding".into()));
        }
        let release_at = stake.unbonding_start_time.saturating_add(period);
        if now < release_at {
            return Err(RelayError::Timing(format!(
                "unbonding releases at {}, now {}",
                release_at, now
            )));
        }
        let amount = std::mem::take(&mut stake.unbonding_amount);
        stake.unbonding_start_time = 0;

        info!(%relayer, amount, "unbonding completed");

        Ok((
            Payout { to: relayer, amount },
            vec![
                ProtocolEvent::UnbondingCompleted { relayer, amount },
                self.publish(&relayer, now)?,
            ],
        ))
    }

    /// Settle a slash decided on an execution chain. Applying the same report
    /// twice is a no-op.
    pub fn apply_slash(
        &mut self,
        report: &SlashReport,
        now: Timestamp,
    ) -> Result<Vec<ProtocolEvent>> {
        let min = self.params.minimum_stake;
        let stake = self.stake_mut(&report.relayer)?;
        if stake.settled_slashes.contains_key(&report.voucher_id) {
            debug!(voucher_id = %report.voucher_id, "slash report already applied");
            return Ok(Vec::new());
        }

        let from_bonded = report.penalty.min(stake.staked_amount);
        stake.staked_amount -= from_bonded;
        let from_unbonding = (report.penalty - from_bonded).min(stake.unbonding_amount);
        stake.unbonding_amount -= from_unbonding;

        let slashed = from_bonded + from_unbonding;
        stake.slashed_amount = stake.slashed_amount.saturating_add(slashed);
        stake.is_active = stake.staked_amount >= min;
        stake
            .settled_slashes
            .insert(report.voucher_id, stake.sequence + 1);
        let active = stake.is_active;
        self.slashed_pool = self.slashed_pool.saturating_add(slashed);

        info!(
            relayer = %report.relayer,
            voucher_id = %report.voucher_id,
            chain_id = report.chain_id,
            slashed,
            active,
            "slash applied"
        );

        Ok(vec![
            ProtocolEvent::SlashReportApplied {
                voucher_id: report.voucher_id,
                relayer: report.relayer,
                slashed,
            },
            self.publish(&report.relayer, now)?,
        ])
    }

    fn stake_mut(&mut self, relayer: &Address) -> Result<&mut XlpStake> {
        self.stakes
            .get_mut(relayer)
            .ok_or_else(|| RelayError::Precondition(format!("relayer {} not registered", relayer)))
    }

    fn publish(&mut self, relayer: &Address, now: Timestamp) -> Result<ProtocolEvent> {
        let stake = self.stake_mut(relayer)?;
        stake.sequence += 1;
        let snapshot = self
            .snapshot(relayer, now)
            .ok_or_else(|| RelayError::Other(format!("relayer {} vanished", relayer)))?;
        Ok(ProtocolEvent::StakeSnapshotPublished(snapshot))
    }
}
