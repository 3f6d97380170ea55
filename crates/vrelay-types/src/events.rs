//! Events emitted by the hub registry and the execution-chain ledgers.
//!
//! Every state transition emits exactly one terminal event, so an observer can
//! rebuild full history from the log alone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Address, Amount, BlockNumber, ChainId, Hash32, StakeSnapshot, Timestamp};

/// Why a voucher was slashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashReason {
    /// `expires_block` passed without a fulfillment.
    DeliveryTimeout,
    /// An attester disputed the delivery inside the claim delay.
    FraudProven,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    RequestCreated {
        request_id: Hash32,
        requester: Address,
        source_token: Address,
        destination_token: Address,
        amount: Amount,
        destination_chain_id: ChainId,
        recipient: Address,
        gas_on_destination: Amount,
        max_fee: Amount,
        fee_increment: Amount,
        deadline: BlockNumber,
        created_block: BlockNumber,
    },
    VoucherIssued {
        voucher_id: Hash32,
        request_id: Hash32,
        relayer: Address,
        fee: Amount,
        issued_block: BlockNumber,
        expires_block: BlockNumber,
    },
    VoucherFulfilled {
        voucher_id: Hash32,
        request_id: Hash32,
        relayer: Address,
        attester: Address,
        fulfilled_block: BlockNumber,
        claimable_at: BlockNumber,
    },
    FundsClaimed {
        voucher_id: Hash32,
        request_id: Hash32,
        relayer: Address,
        payout: Amount,
        protocol_share: Amount,
        requester_rebate: Amount,
    },
    RequestRefunded {
        request_id: Hash32,
        requester: Address,
        amount: Amount,
    },
    VoucherSlashed {
        voucher_id: Hash32,
        request_id: Hash32,
        relayer: Address,
        penalty: Amount,
        reason: SlashReason,
    },
    VoucherDelivered {
        voucher_id: Hash32,
        request_id: Hash32,
        source_chain_id: ChainId,
        relayer: Address,
        recipient: Address,
        token: Address,
        amount: Amount,
        gas: Amount,
    },
    RelayerRegistered {
        relayer: Address,
        staked_amount: Amount,
        supported_chains: BTreeSet<ChainId>,
    },
    StakeAdded {
        relayer: Address,
        amount: Amount,
    },
    UnbondingStarted {
        relayer: Address,
        amount: Amount,
        release_at: Timestamp,
    },
    UnbondingCompleted {
        relayer: Address,
        amount: Amount,
    },
    SlashReportApplied {
        voucher_id: Hash32,
        relayer: Address,
        slashed: Amount,
    },
    StakeSnapshotPublished(StakeSnapshot),
    StakeSnapshotApplied {
        relayer: Address,
        sequence: u64,
    },
    BatchLeafExecuted {
        root: Hash32,
        leaf_hash: Hash32,
        signer: Address,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestCreated,
    VoucherIssued,
    VoucherFulfilled,
    FundsClaimed,
    RequestRefunded,
    VoucherSlashed,
    VoucherDelivered,
    RelayerRegistered,
    StakeAdded,
    UnbondingStarted,
    UnbondingCompleted,
    SlashReportApplied,
    StakeSnapshotPublished,
    StakeSnapshotApplied,
    BatchLeafExecuted,
}

impl ProtocolEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProtocolEvent::RequestCreated { .. } => EventKind::RequestCreated,
            ProtocolEvent::VoucherIssued { .. } => EventKind::VoucherIssued,
            ProtocolEvent::VoucherFulfilled { .. } => EventKind::VoucherFulfilled,
            ProtocolEvent::FundsClaimed { .. } => EventKind::FundsClaimed,
            ProtocolEvent::RequestRefunded { .. } => EventKind::RequestRefunded,
            ProtocolEvent::VoucherSlashed { .. } => EventKind::VoucherSlashed,
            ProtocolEvent::VoucherDelivered { .. } => EventKind::VoucherDelivered,
            ProtocolEvent::RelayerRegistered { .. } => EventKind::RelayerRegistered,
            ProtocolEvent::StakeAdded { .. } => EventKind::StakeAdded,
            ProtocolEvent::UnbondingStarted { .. } => EventKind::UnbondingStarted,
            ProtocolEvent::UnbondingCompleted { .. } => EventKind::UnbondingCompleted,
            ProtocolEvent::SlashReportApplied { .. } => EventKind::SlashReportApplied,
            ProtocolEvent::StakeSnapshotPublished(_) => EventKind::StakeSnapshotPublished,
            ProtocolEvent::StakeSnapshotApplied { .. } => EventKind::StakeSnapshotApplied,
            ProtocolEvent::BatchLeafExecuted { .. } => EventKind::BatchLeafExecuted,
        }
    }

    /// Indexed `request_id` field, if the event has one.
    pub fn request_id(&self) -> Option<Hash32> {
        match self {
            ProtocolEvent::RequestCreated { request_id, .. }
            | ProtocolEvent::VoucherIssued { request_id, .. }
            | ProtocolEvent::VoucherFulfilled { request_id, .. }
            | ProtocolEvent::FundsClaimed { request_id, .. }
            | ProtocolEvent::RequestRefunded { request_id, .. }
            | ProtocolEvent::VoucherSlashed { request_id, .. }
            | ProtocolEvent::VoucherDelivered { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Indexed `voucher_id` field, if the event has one.
    pub fn voucher_id(&self) -> Option<Hash32> {
        match self {
            ProtocolEvent::VoucherIssued { voucher_id, .. }
            | ProtocolEvent::VoucherFulfilled { voucher_id, .. }
            | ProtocolEvent::FundsClaimed { voucher_id, .. }
            | ProtocolEvent::VoucherSlashed { voucher_id, .. }
            | ProtocolEvent::VoucherDelivered { voucher_id, .. }
            | ProtocolEvent::SlashReportApplied { voucher_id, .. } => Some(*voucher_id),
            _ => None,
        }
    }

    /// Indexed `relayer` field, if the event has one.
    pub fn relayer(&self) -> Option<Address> {
        match self {
            ProtocolEvent::VoucherIssued { relayer, .. }
            | ProtocolEvent::VoucherFulfilled { relayer, .. }
            | ProtocolEvent::FundsClaimed { relayer, .. }
            | ProtocolEvent::VoucherSlashed { relayer, .. }
            | ProtocolEvent::VoucherDelivered { relayer, .. }
            | ProtocolEvent::RelayerRegistered { relayer, .. }
            | ProtocolEvent::StakeAdded { relayer, .. }
            | ProtocolEvent::UnbondingStarted { relayer, .. }
            | ProtocolEvent::UnbondingCompleted { relayer, .. }
            | ProtocolEvent::SlashReportApplied { relayer, .. }
            | ProtocolEvent::StakeSnapshotApplied { relayer, .. } => Some(*relayer),
            ProtocolEvent::StakeSnapshotPublished(snapshot) => Some(snapshot.relayer),
            _ => None,
        }
    }
}

/// An event as it appears in a chain's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub tx_hash: Hash32,
    /// Position in the chain's log, strictly increasing.
    pub log_index: u64,
    pub event: ProtocolEvent,
}

/// Log filter on event kind and indexed fields. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub kinds: Vec<EventKind>,
    pub request_id: Option<Hash32>,
    pub voucher_id: Option<Hash32>,
    pub relayer: Option<Address>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn kind(kind: EventKind) -> Self {
        Self {
            kinds: vec![kind],
            ..Default::default()
        }
    }

    pub fn with_request(mut self, request_id: Hash32) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_voucher(mut self, voucher_id: Hash32) -> Self {
        self.voucher_id = Some(voucher_id);
        self
    }

    pub fn with_relayer(mut self, relayer: Address) -> Self {
        self.relayer = Some(relayer);
        self
    }

    pub fn matches(&self, event: &ProtocolEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind()) {
            return false;
        }
        if self.request_id.is_some() && event.request_id() != self.request_id {
            return false;
        }
        if self.voucher_id.is_some() && event.voucher_id() != self.voucher_id {
            return false;
        }
        if self.relayer.is_some() && event.relayer() != self.relayer {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued() -> ProtocolEvent {
        ProtocolEvent::VoucherIssued {
            voucher_id: Hash32::repeat_byte(2),
            request_id: Hash32::repeat_byte(1),
            relayer: Address::repeat_byte(7),
            fee: 6,
            issued_block: 105,
            expires_block: 155,
        }
    }

    #[test]
    fn test_filter_matches_kind_and_indexed_fields() {
        let ev = issued();
        assert!(EventFilter::any().matches(&ev));
        assert!(EventFilter::kind(EventKind::VoucherIssued).matches(&ev));
        assert!(!EventFilter::kind(EventKind::FundsClaimed).matches(&ev));
        assert!(EventFilter::kind(EventKind::VoucherIssued)
            .with_request(Hash32::repeat_byte(1))
            .with_relayer(Address::repeat_byte(7))
            .matches(&ev));
        assert!(!EventFilter::any()
            .with_request(Hash32::repeat_byte(3))
            .matches(&ev));
    }

    #[test]
    fn test_filter_on_missing_field_does_not_match() {
        let ev = ProtocolEvent::StakeAdded {
            relayer: Address::repeat_byte(7),
            amount: 1,
        };
        assert!(!EventFilter::any()
            .with_request(Hash32::repeat_byte(1))
            .matches(&ev));
    }

    #[test]
    fn test_event_json_is_externally_tagged() {
        let json = serde_json::to_value(issued()).unwrap();
        assert!(json.get("voucher_issued").is_some());
    }
}
