//! Destination-side record of voucher payouts.
//!
//! The destination chain cannot read the source chain, so it records what the
//! relayer paid and to whom; attesters compare that with the voucher.
//!
//! Records are keyed by `(voucher_id, relayer)`. Anyone may pay out against a
//! public voucher id, but only the voucher holder's record counts, so a third
//! party's payout never blocks the holder's.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use vrelay_types::{Address, BlockNumber, Hash32, RelayError, Result};

use crate::voucher::VoucherDelivery;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery: VoucherDelivery,
    pub relayer: Address,
    pub delivered_block: BlockNumber,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryBook {
    deliveries: HashMap<(Hash32, Address), DeliveryRecord>,
}

impl DeliveryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, voucher_id: &Hash32, relayer: &Address) -> Option<&DeliveryRecord> {
        self.deliveries.get(&(*voucher_id, *relayer))
    }

    pub fn ensure_not_delivered(&self, voucher_id: &Hash32, relayer: &Address) -> Result<()> {
        if let Some(existing) = self.get(voucher_id, relayer) {
            return Err(RelayError::Precondition(format!(
                "voucher {} already delivered by {} at block {}",
                voucher_id, relayer, existing.delivered_block
            )));
        }
        Ok(())
    }

    pub fn record(
        &mut self,
        delivery: VoucherDelivery,
        relayer: Address,
        now: BlockNumber,
    ) -> Result<&DeliveryRecord> {
        self.ensure_not_delivered(&delivery.voucher_id, &relayer)?;
        let key = (delivery.voucher_id, relayer);
        Ok(self.deliveries.entry(key).or_insert(DeliveryRecord {
            delivery,
            relayer,
            delivered_block: now,
        }))
    }
}
