//! Keeper flow: slash vouchers whose delivery window closed without a
//! fulfillment, which reopens their requests for other relayers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};
use vrelay_chain::{ChainCall, TxRequest};
use vrelay_ledger::SlashEvidence;
use vrelay_types::{
    Address, BlockNumber, ChainId, ErrorKind, EventFilter, EventKind, Hash32, ProtocolEvent,
    Result,
};

use crate::orchestrator::{OperationType, Orchestrator};

pub struct Keeper {
    account: Address,
    orch: Arc<Orchestrator>,
}

impl Keeper {
    pub fn new(account: Address, orch: Arc<Orchestrator>) -> Self {
        Self { account, orch }
    }

    /// Vouchers issued since `from_block` that are still unfulfilled at `now`.
    async fn pending_vouchers(
        &self,
        chain_id: ChainId,
        from_block: BlockNumber,
    ) -> Result<BTreeMap<Hash32, BlockNumber>> {
        let filter = EventFilter {
            kinds: vec![
                EventKind::VoucherIssued,
                EventKind::VoucherFulfilled,
                EventKind::VoucherSlashed,
            ],
            ..Default::default()
        };
        let mut pending = BTreeMap::new();
        for logged in self.orch.history(chain_id, &filter, from_block).await? {
            match logged.event {
                ProtocolEvent::VoucherIssued {
                    voucher_id,
                    expires_block,
                    ..
                } => {
                    pending.insert(voucher_id, expires_block);
                }
                ProtocolEvent::VoucherFulfilled { voucher_id, .. }
                | ProtocolEvent::VoucherSlashed { voucher_id, .. } => {
                    pending.remove(&voucher_id);
                }
                _ => {}
            }
        }
        Ok(pending)
    }

    /// Slash every expired voucher on `chain_id` issued since `from_block`.
    /// Returns the vouchers slashed by this call.
    #[tracing::instrument(skip_all, fields(chain_id = chain_id))]
    pub async fn slash_expired(
        &self,
        chain_id: ChainId,
        from_block: BlockNumber,
    ) -> Result<Vec<Hash32>> {
        let now = self.orch.block_number(chain_id).await?;
        let mut slashed = Vec::new();

        for (voucher_id, expires_block) in self.pending_vouchers(chain_id, from_block).await? {
            if now < expires_block {
                continue;
            }
            let tx = TxRequest::new(
                self.account,
                ChainCall::Slash {
                    voucher_id,
                    evidence: SlashEvidence::DeliveryTimeout,
                },
            );
            match self.orch.submit(OperationType::Slash, chain_id, tx).await {
                Ok(_) => {
                    info!(%voucher_id, expires_block, "expired voucher slashed");
                    slashed.push(voucher_id);
                }
                // someone else got there first, or the chain disagrees on time
                Err(e) if matches!(e.kind(), ErrorKind::Precondition | ErrorKind::Timing) => {
                    debug!(%voucher_id, error = %e, "voucher not slashable");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(slashed)
    }
}
