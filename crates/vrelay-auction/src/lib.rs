//! Dutch-auction fee schedule and relayer bid planning.
//!
//! - Fee: `min(max_fee, fee_increment * (now - created_block))`, never decreasing
//! - Bids: accepted up to one increment above the current rate, capped at `max_fee`
//! - Planning: when a relayer with a minimum acceptable fee should bid

use serde::{Deserialize, Serialize};
use vrelay_types::{Amount, BlockNumber, RelayError, Result};

/// Fee parameters of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub max_fee: Amount,
    pub fee_increment: Amount,
    pub created_block: BlockNumber,
}

/// Fee a relayer earns by filling at `now`.
///
/// A zero increment pins the fee at 0 forever; such a request is valid but
/// nobody will rationally fill it.
pub fn current_fee(schedule: &FeeSchedule, now: BlockNumber) -> Amount {
    let elapsed = now.saturating_sub(schedule.created_block) as Amount;
    schedule
        .fee_increment
        .saturating_mul(elapsed)
        .min(schedule.max_fee)
}

/// Highest fee a voucher signed at `now` may commit to.
///
/// One increment of slack covers the block between signing and inclusion.
pub fn max_acceptable_fee(schedule: &FeeSchedule, now: BlockNumber) -> Amount {
    current_fee(schedule, now)
        .saturating_add(schedule.fee_increment)
        .min(schedule.max_fee)
}

/// Check a committed fee against the schedule at inclusion time.
pub fn check_bid(schedule: &FeeSchedule, now: BlockNumber, fee: Amount) -> Result<()> {
    if fee > schedule.max_fee {
        return Err(RelayError::Economic(format!(
            "fee {} exceeds max_fee {}",
            fee, schedule.max_fee
        )));
    }
    let ceiling = max_acceptable_fee(schedule, now);
    if fee > ceiling {
        return Err(RelayError::Economic(format!(
            "fee {} exceeds current fee plus one increment ({}) at block {}",
            fee, ceiling, now
        )));
    }
    Ok(())
}

/// Reject schedules whose escalation cannot be computed without overflow up
/// to `deadline`.
pub fn validate_schedule(schedule: &FeeSchedule, deadline: BlockNumber) -> Result<()> {
    let span = deadline.saturating_sub(schedule.created_block) as Amount;
    schedule.fee_increment.checked_mul(span).ok_or_else(|| {
        RelayError::Economic(format!(
            "fee_increment {} over {} blocks overflows",
            schedule.fee_increment, span
        ))
    })?;
    schedule
        .max_fee
        .checked_add(schedule.fee_increment)
        .ok_or_else(|| RelayError::Economic("max_fee + fee_increment overflows".into()))?;
    Ok(())
}

/// First block at which `current_fee` reaches `target`, if it ever does.
pub fn block_reaching_fee(schedule: &FeeSchedule, target: Amount) -> Option<BlockNumber> {
    if target == 0 {
        return Some(schedule.created_block);
    }
    if target > schedule.max_fee || schedule.fee_increment == 0 {
        return None;
    }
    let blocks = target.div_ceil(schedule.fee_increment);
    let blocks = BlockNumber::try_from(blocks).ok()?;
    schedule.created_block.checked_add(blocks)
}

/// Relayer-side economics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BidPolicy {
    /// Lowest fee worth fronting liquidity for.
    pub min_fee: Amount,
    /// Largest destination gas drop the relayer is willing to pay.
    pub max_gas_on_destination: Amount,
}

impl Default for BidPolicy {
    fn default() -> Self {
        Self {
            min_fee: 0,
            max_gas_on_destination: Amount::MAX,
        }
    }
}

/// What a relayer should do about one open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidDecision {
    Bid { fee: Amount },
    WaitUntil(BlockNumber),
    Decline(String),
}

/// Decide whether to bid now, later, or never.
pub fn plan_bid(
    schedule: &FeeSchedule,
    gas_on_destination: Amount,
    deadline: BlockNumber,
    now: BlockNumber,
    policy: &BidPolicy,
) -> BidDecision {
    if now > deadline {
        return BidDecision::Decline(format!("deadline {} passed", deadline));
    }
    if gas_on_destination > policy.max_gas_on_destination {
        return BidDecision::Decline(format!(
            "gas on destination {} above policy limit {}",
            gas_on_destination, policy.max_gas_on_destination
        ));
    }
    if policy.min_fee > schedule.max_fee {
        return BidDecision::Decline(format!(
            "max_fee {} below minimum acceptable fee {}",
            schedule.max_fee, policy.min_fee
        ));
    }

    let fee = max_acceptable_fee(schedule, now);
    if fee >= policy.min_fee {
        return BidDecision::Bid { fee };
    }

    let target = policy.min_fee.saturating_sub(schedule.fee_increment);
    match block_reaching_fee(schedule, target) {
        Some(block) if block <= deadline => BidDecision::WaitUntil(block.max(now + 1)),
        _ => BidDecision::Decline(format!(
            "fee does not reach {} before deadline {}",
            policy.min_fee, deadline
        )),
    }
}
