//! Request summaries rebuilt from the event log alone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use vrelay_types::{Address, Amount, BlockNumber, ChainId, Hash32, LoggedEvent, ProtocolEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Open,
    VoucherIssued,
    Fulfilled,
    Claimed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub request_id: Hash32,
    pub source_chain_id: ChainId,
    pub requester: Address,
    pub amount: Amount,
    pub destination_chain_id: ChainId,
    pub recipient: Address,
    pub max_fee: Amount,
    pub deadline: BlockNumber,
    pub created_block: BlockNumber,
    pub phase: RequestPhase,
    pub active_voucher: Option<Hash32>,
    pub relayer: Option<Address>,
    pub fee: Option<Amount>,
    /// Destination payout observed for the active voucher.
    pub delivered: bool,
    pub slashes: u32,
    pub claimable_at: Option<BlockNumber>,
}

impl RequestSummary {
    /// Fold every event of one request, from any chain, into a summary.
    ///
    /// Returns `None` until the `RequestCreated` event has been stored.
    pub fn fold(events: &[LoggedEvent]) -> Option<Self> {
        let created = events
            .iter()
            .find(|e| matches!(e.event, ProtocolEvent::RequestCreated { .. }))?;
        let mut summary = Self::from_created(created)?;

        let mut delivered = BTreeSet::new();
        let mut ordered: Vec<&LoggedEvent> = events.iter().collect();
        ordered.sort_by_key(|e| (e.chain_id != summary.source_chain_id, e.chain_id, e.log_index));
        for event in ordered {
            if event.chain_id == summary.source_chain_id {
                summary.apply(&event.event);
            } else if let ProtocolEvent::VoucherDelivered { voucher_id, .. } = &event.event {
                delivered.insert(*voucher_id);
            }
        }
        summary.delivered = summary
            .active_voucher
            .is_some_and(|v| delivered.contains(&v));
        Some(summary)
    }

    fn from_created(logged: &LoggedEvent) -> Option<Self> {
        let ProtocolEvent::RequestCreated {
            request_id,
            requester,
            amount,
            destination_chain_id,
            recipient,
            max_fee,
            deadline,
            created_block,
            ..
        } = &logged.event
        else {
            return None;
        };
        Some(Self {
            request_id: *request_id,
            source_chain_id: logged.chain_id,
            requester: *requester,
            amount: *amount,
            destination_chain_id: *destination_chain_id,
            recipient: *recipient,
            max_fee: *max_fee,
            deadline: *deadline,
            created_block: *created_block,
            phase: RequestPhase::Open,
            active_voucher: None,
            relayer: None,
            fee: None,
            delivered: false,
            slashes: 0,
            claimable_at: None,
        })
    }

    fn apply(&mut self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::VoucherIssued {
                voucher_id,
                relayer,
                fee,
                ..
            } => {
                self.phase = RequestPhase::VoucherIssued;
                self.active_voucher = Some(*voucher_id);
                self.relayer = Some(*relayer);
                self.fee = Some(*fee);
            }
            ProtocolEvent::VoucherFulfilled { claimable_at, .. } => {
                self.phase = RequestPhase::Fulfilled;
                self.claimable_at = Some(*claimable_at);
            }
            ProtocolEvent::FundsClaimed { .. } => self.phase = RequestPhase::Claimed,
            ProtocolEvent::RequestRefunded { .. } => self.phase = RequestPhase::Refunded,
            ProtocolEvent::VoucherSlashed { .. } => {
                self.phase = RequestPhase::Open;
                self.active_voucher = None;
                self.relayer = None;
                self.fee = None;
                self.claimable_at = None;
                self.slashes += 1;
            }
            _ => {}
        }
    }
}
