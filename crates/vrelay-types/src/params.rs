//! Protocol-wide parameters shared by the hub registry and execution chains.

use serde::{Deserialize, Serialize};

use crate::{Address, Amount, BlockNumber, RelayError, Result};

pub const BPS_DENOMINATOR: u32 = 10_000;

/// Parameters fixed at deployment of a registry or ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    /// Bonded stake below which a relayer may not take new vouchers.
    pub minimum_stake: Amount,
    /// Seconds between `start_unbonding` and `complete_unbonding`.
    pub unbonding_period_secs: u64,
    /// Stake removed per slashed voucher.
    pub slash_penalty: Amount,
    /// Blocks a relayer has to get a voucher marked fulfilled.
    pub delivery_window_blocks: BlockNumber,
    /// Dispute window between fulfillment and claim.
    pub claim_delay_blocks: BlockNumber,
    /// Share of the earned fee kept by the protocol, in basis points.
    pub protocol_fee_bps: u32,
    /// Receiver of the protocol share.
    pub treasury: Address,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            minimum_stake: 1_000_000_000_000_000_000,
            unbonding_period_secs: 7 * 24 * 60 * 60,
            slash_penalty: 100_000_000_000_000_000,
            delivery_window_blocks: 50,
            claim_delay_blocks: 100,
            protocol_fee_bps: 0,
            treasury: Address::ZERO,
        }
    }
}

impl ProtocolParams {
    pub fn validate(&self) -> Result<()> {
        if self.protocol_fee_bps > BPS_DENOMINATOR {
            return Err(RelayError::Config(format!(
                "protocol_fee_bps must be <= {}, got {}",
                BPS_DENOMINATOR, self.protocol_fee_bps
            )));
        }
        if self.claim_delay_blocks == 0 {
            return Err(RelayError::Config("claim_delay_blocks must be > 0".into()));
        }
        if self.delivery_window_blocks == 0 {
            return Err(RelayError::Config("delivery_window_blocks must be > 0".into()));
        }
        if self.minimum_stake == 0 {
            return Err(RelayError::Config("minimum_stake must be > 0".into()));
        }
        if self.protocol_fee_bps > 0 && self.treasury.is_zero() {
            return Err(RelayError::Config(
                "treasury must be set when protocol_fee_bps > 0".into(),
            ));
        }
        Ok(())
    }

    /// Protocol share of an earned fee, rounded down.
    pub fn protocol_share(&self, fee: Amount) -> Amount {
        fee / BPS_DENOMINATOR as Amount * self.protocol_fee_bps as Amount
            + fee % BPS_DENOMINATOR as Amount * self.protocol_fee_bps as Amount
                / BPS_DENOMINATOR as Amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        ProtocolParams::default().validate().unwrap();
    }

    #[test]
    fn test_fee_bps_above_denominator_rejected() {
        let params = ProtocolParams {
            protocol_fee_bps: 10_001,
            treasury: Address::repeat_byte(9),
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_protocol_share_rounds_down_without_overflow() {
        let params = ProtocolParams {
            protocol_fee_bps: 250,
            treasury: Address::repeat_byte(9),
            ..Default::default()
        };
        assert_eq!(params.protocol_share(10_000), 250);
        assert_eq!(params.protocol_share(399), 9);
        // would overflow as fee * bps
        let share = params.protocol_share(u128::MAX);
        assert!(share < u128::MAX / 39);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let params: ProtocolParams = toml::from_str("claim_delay_blocks = 120").unwrap();
        assert_eq!(params.claim_delay_blocks, 120);
        assert_eq!(params.delivery_window_blocks, 50);
    }
}
