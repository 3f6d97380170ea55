//! Execution-chain ledger: transfer requests, voucher lifecycle and escrow.
//!
//! Per request: `Open → VoucherIssued → Fulfilled → (Claimable) → Claimed`,
//! with `Open → Refunded` after the deadline and `VoucherIssued → Open` when a
//! voucher is slashed. A request has at most one live voucher at a time.
//!
//! Every operation validates completely before it mutates anything, so a
//! rejected call leaves the ledger untouched.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};
use vrelay_auction::{check_bid, current_fee, validate_schedule};
use vrelay_crypto::{ids, verify_signer, Encoder};
use vrelay_types::{
    events::SlashReason, Address, Amount, BlockNumber, ChainId, DeliveryAttestation,
    DeliveryVerdict, Hash32, ProtocolEvent, ProtocolParams, RecoverableSignature, RelayError,
    Result, StakeSnapshot,
};

use crate::assets::AssetBook;
use crate::attesters::AttesterSet;
use crate::delivery::{DeliveryBook, DeliveryRecord};
use crate::request::{CreateRequestParams, RequestState, RequestStatus, TransferRequest};
use crate::stake_view::StakeView;
use crate::voucher::{IssueVoucherParams, SlashEvidence, Voucher, VoucherDelivery, VoucherStatus};

/// Account holding escrowed request funds on `chain_id`.
pub fn escrow_address(chain_id: ChainId) -> Address {
    let hash = Encoder::new().tag("vrelay.escrow.v1").u64(chain_id).keccak();
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash.as_bytes()[12..]);
    Address(out)
}

#[derive(Debug, Clone)]
pub struct ExecutionLedger {
    chain_id: ChainId,
    params: ProtocolParams,
    supported_destinations: BTreeSet<ChainId>,
    escrow: Address,
    requests: HashMap<Hash32, TransferRequest>,
    vouchers: HashMap<Hash32, Voucher>,
    assets: AssetBook,
    stake_view: StakeView,
    attesters: AttesterSet,
    deliveries: DeliveryBook,
}

impl ExecutionLedger {
    pub fn new(
        chain_id: ChainId,
        params: ProtocolParams,
        supported_destinations: BTreeSet<ChainId>,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            chain_id,
            params,
            supported_destinations,
            escrow: escrow_address(chain_id),
            requests: HashMap::new(),
            vouchers: HashMap::new(),
            assets: AssetBook::new(),
            stake_view: StakeView::new(),
            attesters: AttesterSet::default(),
            deliveries: DeliveryBook::new(),
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    pub fn escrow(&self) -> Address {
        self.escrow
    }

    pub fn assets(&self) -> &AssetBook {
        &self.assets
    }

    pub fn assets_mut(&mut self) -> &mut AssetBook {
        &mut self.assets
    }

    pub fn stake_view(&self) -> &StakeView {
        &self.stake_view
    }

    pub fn attesters_mut(&mut self) -> &mut AttesterSet {
        &mut self.attesters
    }

    pub fn supports_destination(&self, chain_id: ChainId) -> bool {
        self.supported_destinations.contains(&chain_id)
    }

    pub fn request(&self, request_id: &Hash32) -> Option<&TransferRequest> {
        self.requests.get(request_id)
    }

    pub fn voucher(&self, voucher_id: &Hash32) -> Option<&Voucher> {
        self.vouchers.get(voucher_id)
    }

    pub fn delivery(&self, voucher_id: &Hash32, relayer: &Address) -> Option<&DeliveryRecord> {
        self.deliveries.get(voucher_id, relayer)
    }

    /// Requests a relayer could take a voucher for at `now`.
    pub fn open_requests(&self, now: BlockNumber) -> Vec<&TransferRequest> {
        let mut open: Vec<&TransferRequest> = self
            .requests
            .values()
            .filter(|r| {
                matches!(
                    self.request_state(&r.request_id, now),
                    Ok(RequestState::Open | RequestState::VoucherExpired)
                ) && now <= r.deadline
            })
            .collect();
        open.sort_by_key(|r| (r.created_block, r.request_id));
        open
    }

    fn get_request(&self, request_id: &Hash32) -> Result<&TransferRequest> {
        self.requests
            .get(request_id)
            .ok_or_else(|| RelayError::Precondition(format!("unknown request {}", request_id)))
    }

    fn get_voucher(&self, voucher_id: &Hash32) -> Result<&Voucher> {
        self.vouchers
            .get(voucher_id)
            .ok_or_else(|| RelayError::Precondition(format!("unknown voucher {}", voucher_id)))
    }

    /// Fee a relayer would earn by filling `request_id` at `now`.
    pub fn current_fee(&self, request_id: &Hash32, now: BlockNumber) -> Result<Amount> {
        Ok(current_fee(&self.get_request(request_id)?.fee_schedule(), now))
    }

    pub fn request_state(&self, request_id: &Hash32, now: BlockNumber) -> Result<RequestState> {
        let request = self.get_request(request_id)?;
        let active = request.active_voucher.and_then(|id| self.vouchers.get(&id));
        Ok(match request.status {
            RequestStatus::Open if now > request.deadline => RequestState::Expired,
            RequestStatus::Open => RequestState::Open,
            RequestStatus::VoucherIssued if active.is_some_and(|v| v.is_stale(now)) => {
                RequestState::VoucherExpired
            }
            RequestStatus::VoucherIssued => RequestState::VoucherIssued,
            RequestStatus::Fulfilled => {
                let claimable = active
                    .and_then(|v| v.claimable_at(self.params.claim_delay_blocks))
                    .is_some_and(|at| now >= at);
                if claimable {
                    RequestState::Claimable
                } else {
                    RequestState::Fulfilled
                }
            }
            RequestStatus::Claimed => RequestState::Claimed,
            RequestStatus::Refunded => RequestState::Refunded,
        })
    }

    /// Open a transfer request and escrow `amount + max_fee` from the requester.
    pub fn create_request(
        &mut self,
        requester: Address,
        p: CreateRequestParams,
        now: BlockNumber,
    ) -> Result<(Hash32, Vec<ProtocolEvent>)> {
        if p.amount == 0 {
            return Err(RelayError::Validation("amount must be > 0".into()));
        }
        if p.recipient.is_zero() {
            return Err(RelayError::Validation("recipient must be set".into()));
        }
        if p.destination_chain_id == self.chain_id {
            return Err(RelayError::Validation(format!(
                "destination chain {} is the source chain",
                p.destination_chain_id
            )));
        }
        if !self.supports_destination(p.destination_chain_id) {
            return Err(RelayError::Validation(format!(
                "destination chain {} not supported",
                p.destination_chain_id
            )));
        }
        if p.deadline <= now {
            return Err(RelayError::Validation(format!(
                "deadline {} must be after current block {}",
                p.deadline, now
            )));
        }
        let total = p
            .amount
            .checked_add(p.max_fee)
            .ok_or_else(|| RelayError::Economic("amount + max_fee overflows".into()))?;

        let schedule = vrelay_auction::FeeSchedule {
            max_fee: p.max_fee,
            fee_increment: p.fee_increment,
            created_block: now,
        };
        validate_schedule(&schedule, p.deadline)?;

        let request_id = ids::request_id(&ids::RequestPreimage {
            source_chain_id: self.chain_id,
            requester: &requester,
            source_token: &p.source_token,
            destination_token: &p.destination_token,
            amount: p.amount,
            destination_chain_id: p.destination_chain_id,
            recipient: &p.recipient,
            nonce: p.nonce,
        });
        if self.requests.contains_key(&request_id) {
            return Err(RelayError::Precondition(format!(
                "request {} already exists; use a different nonce",
                request_id
            )));
        }

        if p.source_token == Address::NATIVE {
            self.assets
                .transfer(&requester, &self.escrow, &Address::NATIVE, total)?;
        } else {
            let escrow = self.escrow;
            self.assets
                .transfer_from(&escrow, &requester, &escrow, &p.source_token, total)?;
        }

        if p.fee_increment == 0 {
            warn!(%request_id, "request created with zero fee increment; fee stays at 0");
        }

        let request = TransferRequest {
            request_id,
            requester,
            source_chain_id: self.chain_id,
            source_token: p.source_token,
            destination_token: p.destination_token,
            amount: p.amount,
            destination_chain_id: p.destination_chain_id,
            recipient: p.recipient,
            gas_on_destination: p.gas_on_destination,
            max_fee: p.max_fee,
            fee_increment: p.fee_increment,
            deadline: p.deadline,
            created_block: now,
            nonce: p.nonce,
            status: RequestStatus::Open,
            active_voucher: None,
            voucher_history: Vec::new(),
        };

        info!(
            %request_id,
            %requester,
            amount = p.amount,
            destination_chain_id = p.destination_chain_id,
            deadline = p.deadline,
            "transfer request created"
        );

        let event = ProtocolEvent::RequestCreated {
            request_id,
            requester,
            source_token: request.source_token,
            destination_token: request.destination_token,
            amount: request.amount,
            destination_chain_id: request.destination_chain_id,
            recipient: request.recipient,
            gas_on_destination: request.gas_on_destination,
            max_fee: request.max_fee,
            fee_increment: request.fee_increment,
            deadline: request.deadline,
            created_block: now,
        };
        self.requests.insert(request_id, request);
        Ok((request_id, vec![event]))
    }

    /// Give one relayer the exclusive right to fill a request at its signed fee.
    ///
    /// A voucher left stale by another relayer is slashed in the same step.
    pub fn issue_voucher(
        &mut self,
        p: IssueVoucherParams,
        now: BlockNumber,
    ) -> Result<(Hash32, Vec<ProtocolEvent>)> {
        let request = self.get_request(&p.request_id)?;

        let stale = request
            .active_voucher
            .and_then(|id| self.vouchers.get(&id))
            .filter(|v| v.is_stale(now));
        let reopened = request.status == RequestStatus::VoucherIssued && stale.is_some();
        if request.status != RequestStatus::Open && !reopened {
            return Err(RelayError::Precondition(format!(
                "request {} is not open (status {:?})",
                p.request_id, request.status
            )));
        }
        if let Some(stale) = stale {
            if stale.relayer == p.relayer {
                return Err(RelayError::Precondition(format!(
                    "relayer {} holds expired voucher {} for this request",
                    p.relayer, stale.voucher_id
                )));
            }
        }
        if now > request.deadline {
            return Err(RelayError::Timing(format!(
                "request deadline {} passed",
                request.deadline
            )));
        }

        self.stake_view.ensure_eligible(
            &p.relayer,
            request.destination_chain_id,
            self.params.minimum_stake,
        )?;
        check_bid(&request.fee_schedule(), now, p.fee)?;

        let commitment = ids::voucher_commitment(
            &request.request_id,
            &p.relayer,
            request.amount,
            p.fee,
            request.destination_chain_id,
        );
        verify_signer(&commitment, &p.signature, &p.relayer)?;

        let voucher_id = ids::voucher_id(
            &request.request_id,
            &p.relayer,
            p.fee,
            self.chain_id,
            request.destination_chain_id,
        );
        if self.vouchers.contains_key(&voucher_id) {
            return Err(RelayError::Precondition(format!(
                "voucher {} was already issued",
                voucher_id
            )));
        }

        let expires_block = now.saturating_add(self.params.delivery_window_blocks);
        let voucher = Voucher {
            voucher_id,
            request_id: request.request_id,
            relayer: p.relayer,
            fee: p.fee,
            source_chain_id: self.chain_id,
            destination_chain_id: request.destination_chain_id,
            source_token: request.source_token,
            destination_token: request.destination_token,
            amount: request.amount,
            recipient: request.recipient,
            gas_provided: request.gas_on_destination,
            issued_block: now,
            expires_block,
            fulfilled_block: None,
            attester: None,
            status: VoucherStatus::Issued,
        };
        let stale_id = stale.map(|v| v.voucher_id);

        let mut events = Vec::new();
        if let Some(stale_id) = stale_id {
            events.push(self.slash_voucher(&stale_id, SlashReason::DeliveryTimeout)?);
        }

        self.vouchers.insert(voucher_id, voucher);
        let request = self.request_mut(&p.request_id)?;
        request.status = RequestStatus::VoucherIssued;
        request.active_voucher = Some(voucher_id);
        request.voucher_history.push(voucher_id);

        info!(
            %voucher_id,
            request_id = %p.request_id,
            relayer = %p.relayer,
            fee = p.fee,
            expires_block,
            "voucher issued"
        );

        events.push(ProtocolEvent::VoucherIssued {
            voucher_id,
            request_id: p.request_id,
            relayer: p.relayer,
            fee: p.fee,
            issued_block: now,
            expires_block,
        });
        Ok((voucher_id, events))
    }

    /// Destination side: the relayer pays the recipient and the payout is recorded once.
    pub fn deliver_voucher(
        &mut self,
        relayer: Address,
        delivery: VoucherDelivery,
        now: BlockNumber,
    ) -> Result<Vec<ProtocolEvent>> {
        if delivery.amount == 0 {
            return Err(RelayError::Validation("delivery amount must be > 0".into()));
        }
        if delivery.recipient.is_zero() {
            return Err(RelayError::Validation("delivery recipient must be set".into()));
        }
        self.deliveries
            .ensure_not_delivered(&delivery.voucher_id, &relayer)?;

        if delivery.token == Address::NATIVE {
            let total = delivery
                .amount
                .checked_add(delivery.gas)
                .ok_or_else(|| RelayError::Economic("amount + gas overflows".into()))?;
            self.assets
                .ensure_balance(&relayer, &Address::NATIVE, total)?;
        } else {
            self.assets
                .ensure_balance(&relayer, &delivery.token, delivery.amount)?;
            self.assets
                .ensure_balance(&relayer, &Address::NATIVE, delivery.gas)?;
        }

        self.assets
            .transfer(&relayer, &delivery.recipient, &delivery.token, delivery.amount)?;
        self.assets
            .transfer(&relayer, &delivery.recipient, &Address::NATIVE, delivery.gas)?;

        let record = self.deliveries.record(delivery, relayer, now)?;
        let d = &record.delivery;

        info!(
            voucher_id = %d.voucher_id,
            %relayer,
            recipient = %d.recipient,
            amount = d.amount,
            "voucher delivered"
        );

        Ok(vec![ProtocolEvent::VoucherDelivered {
            voucher_id: d.voucher_id,
            request_id: d.request_id,
            source_chain_id: d.source_chain_id,
            relayer,
            recipient: d.recipient,
            token: d.token,
            amount: d.amount,
            gas: d.gas,
        }])
    }

    /// Record attested delivery and start the claim delay.
    pub fn mark_fulfilled(
        &mut self,
        attestation: &DeliveryAttestation,
        signature: &RecoverableSignature,
        now: BlockNumber,
    ) -> Result<Vec<ProtocolEvent>> {
        let voucher = self.get_voucher(&attestation.voucher_id)?;
        if voucher.status != VoucherStatus::Issued {
            return Err(RelayError::Precondition(format!(
                "voucher {} is {:?}, not issued",
                voucher.voucher_id, voucher.status
            )));
        }
        if now >= voucher.expires_block {
            return Err(RelayError::Precondition(format!(
                "delivery window of voucher {} closed at block {}",
                voucher.voucher_id, voucher.expires_block
            )));
        }
        if attestation.verdict != DeliveryVerdict::Delivered {
            return Err(RelayError::Validation(
                "attestation verdict is not `delivered`".into(),
            ));
        }
        check_attestation_matches(attestation, voucher)?;
        let attester = self.attesters.verify(attestation, signature)?;

        let claim_delay = self.params.claim_delay_blocks;
        let voucher_id = voucher.voucher_id;
        let voucher = self.voucher_mut(&voucher_id)?;
        voucher.status = VoucherStatus::Fulfilled;
        voucher.fulfilled_block = Some(now);
        voucher.attester = Some(attester);
        let (request_id, relayer) = (voucher.request_id, voucher.relayer);
        self.request_mut(&request_id)?.status = RequestStatus::Fulfilled;

        let claimable_at = now.saturating_add(claim_delay);
        info!(%voucher_id, %attester, claimable_at, "voucher fulfilled");

        Ok(vec![ProtocolEvent::VoucherFulfilled {
            voucher_id,
            request_id,
            relayer,
            attester,
            fulfilled_block: now,
            claimable_at,
        }])
    }

    /// Release escrow to the relayer once the claim delay has passed.
    pub fn claim_source_funds(
        &mut self,
        voucher_id: &Hash32,
        now: BlockNumber,
    ) -> Result<Vec<ProtocolEvent>> {
        let voucher = self.get_voucher(voucher_id)?;
        match voucher.status {
            VoucherStatus::Fulfilled => {}
            VoucherStatus::Claimed => {
                return Err(RelayError::Precondition(format!(
                    "voucher {} already claimed",
                    voucher_id
                )))
            }
            other => {
                return Err(RelayError::Precondition(format!(
                    "voucher {} is {:?}, not fulfilled",
                    voucher_id, other
                )))
            }
        }
        let claimable_at = voucher
            .claimable_at(self.params.claim_delay_blocks)
            .ok_or_else(|| RelayError::Other("fulfilled voucher without block".into()))?;
        if now < claimable_at {
            return Err(RelayError::Timing(format!(
                "voucher {} claimable at block {}, now {}",
                voucher_id, claimable_at, now
            )));
        }

        let request = self.get_request(&voucher.request_id)?;
        let protocol_share = self.params.protocol_share(voucher.fee);
        let payout = voucher
            .amount
            .checked_add(voucher.fee)
            .and_then(|gross| gross.checked_sub(protocol_share))
            .ok_or_else(|| {
                RelayError::Economic(format!(
                    "voucher {} payout out of range (protocol share {})",
                    voucher_id, protocol_share
                ))
            })?;
        let rebate = request.max_fee.checked_sub(voucher.fee).ok_or_else(|| {
            RelayError::Economic(format!("voucher {} fee exceeds request max fee", voucher_id))
        })?;
        let (relayer, requester, token, request_id) = (
            voucher.relayer,
            request.requester,
            request.source_token,
            request.request_id,
        );
        let treasury = self.params.treasury;
        let escrow = self.escrow;

        self.assets.transfer(&escrow, &relayer, &token, payout)?;
        self.assets
            .transfer(&escrow, &treasury, &token, protocol_share)?;
        self.assets.transfer(&escrow, &requester, &token, rebate)?;

        self.voucher_mut(voucher_id)?.status = VoucherStatus::Claimed;
        self.request_mut(&request_id)?.status = RequestStatus::Claimed;

        info!(%voucher_id, %relayer, payout, protocol_share, rebate, "source funds claimed");

        Ok(vec![ProtocolEvent::FundsClaimed {
            voucher_id: *voucher_id,
            request_id,
            relayer,
            payout,
            protocol_share,
            requester_rebate: rebate,
        }])
    }

    /// Penalize a relayer for non-delivery or disputed delivery and reopen the request.
    pub fn slash(
        &mut self,
        voucher_id: &Hash32,
        evidence: &SlashEvidence,
        now: BlockNumber,
    ) -> Result<Vec<ProtocolEvent>> {
        let voucher = self.get_voucher(voucher_id)?;
        if matches!(voucher.status, VoucherStatus::Claimed | VoucherStatus::Slashed) {
            return Err(RelayError::Precondition(format!(
                "voucher {} is {:?}",
                voucher_id, voucher.status
            )));
        }

        let reason = match evidence {
            SlashEvidence::DeliveryTimeout => {
                if voucher.status != VoucherStatus::Issued {
                    return Err(RelayError::Precondition(format!(
                        "voucher {} was fulfilled",
                        voucher_id
                    )));
                }
                if now < voucher.expires_block {
                    return Err(RelayError::Timing(format!(
                        "voucher {} deliverable until block {}",
                        voucher_id, voucher.expires_block
                    )));
                }
                SlashReason::DeliveryTimeout
            }
            SlashEvidence::Fraud {
                attestation,
                signature,
            } => {
                if voucher.status != VoucherStatus::Fulfilled {
                    return Err(RelayError::Precondition(format!(
                        "fraud evidence needs a fulfilled voucher, {} is {:?}",
                        voucher_id, voucher.status
                    )));
                }
                let window_end = voucher
                    .claimable_at(self.params.claim_delay_blocks)
                    .unwrap_or(0);
                if now >= window_end {
                    return Err(RelayError::Precondition(format!(
                        "dispute window of voucher {} closed at block {}",
                        voucher_id, window_end
                    )));
                }
                if attestation.voucher_id != *voucher_id {
                    return Err(RelayError::Validation(
                        "evidence refers to another voucher".into(),
                    ));
                }
                if attestation.verdict != DeliveryVerdict::Invalid {
                    return Err(RelayError::Validation(
                        "evidence verdict is not `invalid`".into(),
                    ));
                }
                self.attesters.verify(attestation, signature)?;
                SlashReason::FraudProven
            }
        };

        Ok(vec![self.slash_voucher(voucher_id, reason)?])
    }

    /// Return escrow to the requester of an expired, unfilled request.
    pub fn refund_expired(
        &mut self,
        request_id: &Hash32,
        now: BlockNumber,
    ) -> Result<Vec<ProtocolEvent>> {
        let request = self.get_request(request_id)?;
        match request.status {
            RequestStatus::Claimed | RequestStatus::Refunded => {
                return Err(RelayError::Precondition(format!(
                    "request {} already {:?}",
                    request_id, request.status
                )))
            }
            RequestStatus::Fulfilled => {
                return Err(RelayError::Precondition(format!(
                    "request {} has a fulfilled voucher",
                    request_id
                )))
            }
            RequestStatus::Open | RequestStatus::VoucherIssued => {}
        }
        if now <= request.deadline {
            return Err(RelayError::Timing(format!(
                "request {} refundable after block {}",
                request_id, request.deadline
            )));
        }

        let mut stale = None;
        if request.status == RequestStatus::VoucherIssued {
            let voucher = request
                .active_voucher
                .and_then(|id| self.vouchers.get(&id))
                .ok_or_else(|| RelayError::Other("issued request without voucher".into()))?;
            if !voucher.is_stale(now) {
                return Err(RelayError::Precondition(format!(
                    "voucher {} in flight until block {}",
                    voucher.voucher_id, voucher.expires_block
                )));
            }
            stale = Some(voucher.voucher_id);
        }

        let (requester, token, total) = (request.requester, request.source_token, request.escrowed());

        let mut events = Vec::new();
        if let Some(stale) = stale {
            events.push(self.slash_voucher(&stale, SlashReason::DeliveryTimeout)?);
        }

        let escrow = self.escrow;
        self.assets.transfer(&escrow, &requester, &token, total)?;
        self.request_mut(request_id)?.status = RequestStatus::Refunded;

        info!(%request_id, %requester, amount = total, "request refunded");

        events.push(ProtocolEvent::RequestRefunded {
            request_id: *request_id,
            requester,
            amount: total,
        });
        Ok(events)
    }

    /// Apply a hub stake snapshot. Stale or repeated snapshots emit nothing.
    pub fn apply_stake_snapshot(&mut self, snapshot: StakeSnapshot) -> Vec<ProtocolEvent> {
        let (relayer, sequence) = (snapshot.relayer, snapshot.sequence);
        if self.stake_view.apply(snapshot) {
            debug!(%relayer, sequence, chain_id = self.chain_id, "stake snapshot applied");
            vec![ProtocolEvent::StakeSnapshotApplied { relayer, sequence }]
        } else {
            debug!(%relayer, sequence, "stale stake snapshot ignored");
            Vec::new()
        }
    }

    fn slash_voucher(&mut self, voucher_id: &Hash32, reason: SlashReason) -> Result<ProtocolEvent> {
        let penalty = self.params.slash_penalty;
        let voucher = self.voucher_mut(voucher_id)?;
        voucher.status = VoucherStatus::Slashed;
        let (request_id, relayer) = (voucher.request_id, voucher.relayer);

        let request = self.request_mut(&request_id)?;
        request.status = RequestStatus::Open;
        request.active_voucher = None;

        self.stake_view.record_slash(&relayer, *voucher_id, penalty);

        warn!(%voucher_id, %relayer, ?reason, penalty, "voucher slashed; request reopened");

        Ok(ProtocolEvent::VoucherSlashed {
            voucher_id: *voucher_id,
            request_id,
            relayer,
            penalty,
            reason,
        })
    }

    fn request_mut(&mut self, request_id: &Hash32) -> Result<&mut TransferRequest> {
        self.requests
            .get_mut(request_id)
            .ok_or_else(|| RelayError::Precondition(format!("unknown request {}", request_id)))
    }

    fn voucher_mut(&mut self, voucher_id: &Hash32) -> Result<&mut Voucher> {
        self.vouchers
            .get_mut(voucher_id)
            .ok_or_else(|| RelayError::Precondition(format!("unknown voucher {}", voucher_id)))
    }
}

fn check_attestation_matches(a: &DeliveryAttestation, v: &Voucher) -> Result<()> {
    let mismatch = if a.request_id != v.request_id {
        Some("request_id")
    } else if a.destination_chain_id != v.destination_chain_id {
        Some("destination_chain_id")
    } else if a.recipient != v.recipient {
        Some("recipient")
    } else if a.amount != v.amount {
        Some("amount")
    } else {
        None
    };
    match mismatch {
        Some(field) => Err(RelayError::Validation(format!(
            "attestation {} does not match voucher {}",
            field, v.voucher_id
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrelay_crypto::{sign_digest, KeyPair};
    use vrelay_types::ErrorKind;

    const ETH: Amount = 1_000_000_000_000_000_000;
    const SRC: ChainId = 1;
    const DST: ChainId = 2;

    struct Fixture {
        ledger: ExecutionLedger,
        requester: Address,
        relayer: KeyPair,
        other_relayer: KeyPair,
        attester: KeyPair,
    }

    fn params() -> ProtocolParams {
        ProtocolParams {
            minimum_stake: 10 * ETH,
            slash_penalty: ETH,
            delivery_window_blocks: 50,
            claim_delay_blocks: 100,
            protocol_fee_bps: 1_000,
            treasury: Address::repeat_byte(0xfe),
            ..Default::default()
        }
    }

    fn snapshot(relayer: Address, sequence: u64, staked: Amount) -> StakeSnapshot {
        StakeSnapshot {
            relayer,
            staked_amount: staked,
            is_active: staked >= 10 * ETH,
            supported_chains: [SRC, DST].into_iter().collect(),
            sequence,
            settled_slashes: Default::default(),
            taken_at: 0,
        }
    }

    fn fixture() -> Fixture {
        let mut ledger = ExecutionLedger::new(SRC, params(), [DST].into_iter().collect()).unwrap();
        let requester = Address::repeat_byte(0x11);
        let relayer = KeyPair::from_seed("ledger relayer seed 0001", None).unwrap();
        let other_relayer = KeyPair::from_seed("ledger relayer seed 0002", None).unwrap();
        let attester = KeyPair::from_seed("ledger attester seed 001", None).unwrap();

        ledger
            .assets_mut()
            .mint(requester, Address::NATIVE, 100 * ETH)
            .unwrap();
        ledger.apply_stake_snapshot(snapshot(relayer.address(), 1, 20 * ETH));
        ledger.apply_stake_snapshot(snapshot(other_relayer.address(), 1, 20 * ETH));
        ledger.attesters_mut().add(attester.address());

        Fixture {
            ledger,
            requester,
            relayer,
            other_relayer,
            attester,
        }
    }

    fn request_params(nonce: u64) -> CreateRequestParams {
        CreateRequestParams {
            source_token: Address::NATIVE,
            destination_token: Address::NATIVE,
            amount: ETH,
            destination_chain_id: DST,
            recipient: Address::repeat_byte(0x22),
            gas_on_destination: 0,
            max_fee: ETH / 10,
            fee_increment: ETH / 100,
            deadline: 1_000,
            nonce,
        }
    }

    fn bid(f: &Fixture, relayer: &KeyPair, request_id: Hash32, fee: Amount) -> IssueVoucherParams {
        let request = f.ledger.request(&request_id).unwrap();
        let commitment = ids::voucher_commitment(
            &request_id,
            &relayer.address(),
            request.amount,
            fee,
            request.destination_chain_id,
        );
        IssueVoucherParams {
            request_id,
            relayer: relayer.address(),
            fee,
            signature: sign_digest(relayer, &commitment).unwrap(),
        }
    }

    fn attest(
        f: &Fixture,
        voucher_id: Hash32,
        verdict: DeliveryVerdict,
    ) -> (DeliveryAttestation, RecoverableSignature) {
        let v = f.ledger.voucher(&voucher_id).unwrap();
        let attestation = DeliveryAttestation {
            voucher_id,
            request_id: v.request_id,
            destination_chain_id: v.destination_chain_id,
            recipient: v.recipient,
            amount: v.amount,
            verdict,
            observed_block: 0,
        };
        let sig = sign_digest(&f.attester, &ids::attestation_digest(&attestation)).unwrap();
        (attestation, sig)
    }

    fn create(f: &mut Fixture, at: BlockNumber) -> Hash32 {
        let requester = f.requester;
        f.ledger
            .create_request(requester, request_params(at), at)
            .unwrap()
            .0
    }

    #[test]
    fn test_create_request_escrows_amount_plus_max_fee() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let escrow = f.ledger.escrow();
        assert_eq!(
            f.ledger.assets().balance_of(&escrow, &Address::NATIVE),
            ETH + ETH / 10
        );
        assert_eq!(f.ledger.request_state(&id, 100).unwrap(), RequestState::Open);
        assert_eq!(f.ledger.current_fee(&id, 105).unwrap(), 5 * ETH / 100);

        // literal duplicate
        let requester = f.requester;
        let err = f
            .ledger
            .create_request(requester, request_params(100), 100)
            .unwrap_err();
        assert!(matches!(err, RelayError::Precondition(_)));
    }

    #[test]
    fn test_create_request_validation() {
        let mut f = fixture();
        let requester = f.requester;
        let cases = [
            CreateRequestParams {
                amount: 0,
                ..request_params(1)
            },
            CreateRequestParams {
                destination_chain_id: 99,
                ..request_params(1)
            },
            CreateRequestParams {
                destination_chain_id: SRC,
                ..request_params(1)
            },
            CreateRequestParams {
                deadline: 100,
                ..request_params(1)
            },
            CreateRequestParams {
                recipient: Address::ZERO,
                ..request_params(1)
            },
        ];
        for p in cases {
            let err = f.ledger.create_request(requester, p, 100).unwrap_err();
            assert!(matches!(err, RelayError::Validation(_)), "{:?}", err);
        }

        let overflow = CreateRequestParams {
            amount: Amount::MAX,
            ..request_params(1)
        };
        let err = f.ledger.create_request(requester, overflow, 100).unwrap_err();
        assert!(matches!(err, RelayError::Economic(_)));
    }

    #[test]
    fn test_token_request_needs_allowance() {
        let mut f = fixture();
        let token = Address::repeat_byte(0x70);
        let requester = f.requester;
        f.ledger.assets_mut().mint(requester, token, 10 * ETH).unwrap();
        let p = CreateRequestParams {
            source_token: token,
            destination_token: token,
            ..request_params(1)
        };
        let err = f.ledger.create_request(requester, p.clone(), 100).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let escrow = f.ledger.escrow();
        f.ledger
            .assets_mut()
            .approve(requester, escrow, token, ETH + ETH / 10);
        f.ledger.create_request(requester, p, 100).unwrap();
        assert_eq!(f.ledger.assets().balance_of(&escrow, &token), ETH + ETH / 10);
    }

    #[test]
    fn test_voucher_exclusivity_scenario() {
        let mut f = fixture();
        let id = create(&mut f, 100);

        let p = bid(&f, &f.relayer, id, 6 * ETH / 100);
        let (voucher_id, events) = f.ledger.issue_voucher(p, 105).unwrap();
        assert!(matches!(events[0], ProtocolEvent::VoucherIssued { .. }));
        assert_eq!(f.ledger.voucher(&voucher_id).unwrap().expires_block, 155);

        let p = bid(&f, &f.other_relayer, id, 6 * ETH / 100);
        let err = f.ledger.issue_voucher(p, 106).unwrap_err();
        assert!(matches!(err, RelayError::Precondition(_)));
    }

    #[test]
    fn test_issue_voucher_rejections() {
        let mut f = fixture();
        let id = create(&mut f, 100);

        // above current fee + one increment
        let p = bid(&f, &f.relayer, id, 7 * ETH / 100);
        assert!(matches!(
            f.ledger.issue_voucher(p, 105),
            Err(RelayError::Economic(_))
        ));

        // signature by someone else
        let mut p = bid(&f, &f.other_relayer, id, ETH / 100);
        p.relayer = f.relayer.address();
        assert!(matches!(
            f.ledger.issue_voucher(p, 105),
            Err(RelayError::Authorization(_))
        ));

        // unknown relayer
        let stranger = KeyPair::from_seed("stranger relayer seed 01", None).unwrap();
        let p = bid(&f, &stranger, id, ETH / 100);
        assert!(matches!(
            f.ledger.issue_voucher(p, 105),
            Err(RelayError::Authorization(_))
        ));

        // past deadline
        let p = bid(&f, &f.relayer, id, ETH / 100);
        assert!(matches!(
            f.ledger.issue_voucher(p, 1_001),
            Err(RelayError::Timing(_))
        ));
    }

    #[test]
    fn test_under_collateralized_relayer_rejected() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let relayer = f.relayer.address();
        f.ledger.apply_stake_snapshot(snapshot(relayer, 2, 5 * ETH));
        let p = bid(&f, &f.relayer, id, ETH / 100);
        assert!(matches!(
            f.ledger.issue_voucher(p, 105),
            Err(RelayError::Authorization(_))
        ));
    }

    #[test]
    fn test_full_lifecycle_and_claim_delay() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let fee = 6 * ETH / 100;
        let p = bid(&f, &f.relayer, id, fee);
        let (voucher_id, _) = f.ledger.issue_voucher(p, 105).unwrap();

        let (att, sig) = attest(&f, voucher_id, DeliveryVerdict::Delivered);
        f.ledger.mark_fulfilled(&att, &sig, 120).unwrap();
        assert_eq!(f.ledger.request_state(&id, 120).unwrap(), RequestState::Fulfilled);
        assert!(f.ledger.voucher(&voucher_id).unwrap().fulfilled());

        let err = f.ledger.claim_source_funds(&voucher_id, 219).unwrap_err();
        assert!(matches!(err, RelayError::Timing(_)));
        assert_eq!(f.ledger.request_state(&id, 220).unwrap(), RequestState::Claimable);

        let events = f.ledger.claim_source_funds(&voucher_id, 220).unwrap();
        let share = fee / 10;
        assert_eq!(
            events[0],
            ProtocolEvent::FundsClaimed {
                voucher_id,
                request_id: id,
                relayer: f.relayer.address(),
                payout: ETH + fee - share,
                protocol_share: share,
                requester_rebate: ETH / 10 - fee,
            }
        );
        let escrow = f.ledger.escrow();
        assert_eq!(f.ledger.assets().balance_of(&escrow, &Address::NATIVE), 0);
        assert_eq!(
            f.ledger
                .assets()
                .balance_of(&Address::repeat_byte(0xfe), &Address::NATIVE),
            share
        );

        // no double payment
        assert!(matches!(
            f.ledger.claim_source_funds(&voucher_id, 300),
            Err(RelayError::Precondition(_))
        ));
        assert!(matches!(
            f.ledger.refund_expired(&id, 2_000),
            Err(RelayError::Precondition(_))
        ));
        assert!(f.ledger.request(&id).unwrap().claimed());
    }

    #[test]
    fn test_mark_fulfilled_checks() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let p = bid(&f, &f.relayer, id, ETH / 100);
        let (voucher_id, _) = f.ledger.issue_voucher(p, 101).unwrap();

        let (mut att, _) = attest(&f, voucher_id, DeliveryVerdict::Delivered);
        att.amount -= 1;
        let sig = sign_digest(&f.attester, &ids::attestation_digest(&att)).unwrap();
        assert!(matches!(
            f.ledger.mark_fulfilled(&att, &sig, 110),
            Err(RelayError::Validation(_))
        ));

        let (att, _) = attest(&f, voucher_id, DeliveryVerdict::Delivered);
        let forged = sign_digest(&f.relayer, &ids::attestation_digest(&att)).unwrap();
        assert!(matches!(
            f.ledger.mark_fulfilled(&att, &forged, 110),
            Err(RelayError::Authorization(_))
        ));

        let (att, sig) = attest(&f, voucher_id, DeliveryVerdict::Delivered);
        assert!(matches!(
            f.ledger.mark_fulfilled(&att, &sig, 151),
            Err(RelayError::Precondition(_))
        ));
    }

    #[test]
    fn test_delivery_timeout_slash_reopens_request_scenario() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let p = bid(&f, &f.relayer, id, ETH / 100);
        let (voucher_id, _) = f.ledger.issue_voucher(p, 200).unwrap();

        let err = f
            .ledger
            .slash(&voucher_id, &SlashEvidence::DeliveryTimeout, 249)
            .unwrap_err();
        assert!(matches!(err, RelayError::Timing(_)));
        assert_eq!(
            f.ledger.request_state(&id, 250).unwrap(),
            RequestState::VoucherExpired
        );

        let events = f
            .ledger
            .slash(&voucher_id, &SlashEvidence::DeliveryTimeout, 250)
            .unwrap();
        assert!(matches!(
            events[0],
            ProtocolEvent::VoucherSlashed {
                penalty,
                reason: SlashReason::DeliveryTimeout,
                ..
            } if penalty == ETH
        ));
        let relayer = f.relayer.address();
        assert_eq!(f.ledger.stake_view().effective_stake(&relayer), 19 * ETH);

        let request = f.ledger.request(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Open);
        assert_eq!(request.created_block, 100);
        assert!(f.ledger.voucher(&voucher_id).unwrap().slashed());
        // fee keeps escalating from the original creation block
        assert_eq!(f.ledger.current_fee(&id, 250).unwrap(), ETH / 10);

        // re-auction to another relayer
        let p = bid(&f, &f.other_relayer, id, ETH / 10);
        f.ledger.issue_voucher(p, 251).unwrap();
    }

    #[test]
    fn test_stale_voucher_slashed_on_reissue() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let p = bid(&f, &f.relayer, id, ETH / 100);
        let (stale_id, _) = f.ledger.issue_voucher(p, 101).unwrap();

        // the holder of the expired voucher cannot re-bid
        let p = bid(&f, &f.relayer, id, ETH / 10);
        assert!(matches!(
            f.ledger.issue_voucher(p, 160),
            Err(RelayError::Precondition(_))
        ));

        let p = bid(&f, &f.other_relayer, id, ETH / 10);
        let (_, events) = f.ledger.issue_voucher(p, 160).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProtocolEvent::VoucherSlashed { voucher_id, .. } if voucher_id == stale_id));
        assert_eq!(f.ledger.request(&id).unwrap().voucher_history.len(), 2);
    }

    #[test]
    fn test_fraud_slash_inside_claim_delay() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let p = bid(&f, &f.relayer, id, ETH / 100);
        let (voucher_id, _) = f.ledger.issue_voucher(p, 101).unwrap();
        let (att, sig) = attest(&f, voucher_id, DeliveryVerdict::Delivered);
        f.ledger.mark_fulfilled(&att, &sig, 110).unwrap();

        // a `delivered` verdict is not fraud evidence
        let evidence = SlashEvidence::Fraud {
            attestation: att,
            signature: sig,
        };
        assert!(matches!(
            f.ledger.slash(&voucher_id, &evidence, 150),
            Err(RelayError::Validation(_))
        ));

        let (att, sig) = attest(&f, voucher_id, DeliveryVerdict::Invalid);
        let evidence = SlashEvidence::Fraud {
            attestation: att,
            signature: sig,
        };
        assert!(matches!(
            f.ledger.slash(&voucher_id, &evidence, 210),
            Err(RelayError::Precondition(_))
        ));
        f.ledger.slash(&voucher_id, &evidence, 209).unwrap();
        assert_eq!(f.ledger.request_state(&id, 209).unwrap(), RequestState::Open);
        assert!(matches!(
            f.ledger.claim_source_funds(&voucher_id, 300),
            Err(RelayError::Precondition(_))
        ));
    }

    #[test]
    fn test_refund_rules() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let requester = f.requester;

        assert!(matches!(
            f.ledger.refund_expired(&id, 1_000),
            Err(RelayError::Timing(_))
        ));
        assert_eq!(f.ledger.request_state(&id, 1_001).unwrap(), RequestState::Expired);

        f.ledger.refund_expired(&id, 1_001).unwrap();
        assert_eq!(
            f.ledger.assets().balance_of(&requester, &Address::NATIVE),
            100 * ETH
        );
        assert!(f.ledger.request(&id).unwrap().refunded());
        assert!(matches!(
            f.ledger.refund_expired(&id, 1_002),
            Err(RelayError::Precondition(_))
        ));
    }

    #[test]
    fn test_in_flight_voucher_blocks_refund_until_stale() {
        let mut f = fixture();
        let id = create(&mut f, 100);
        let p = bid(&f, &f.relayer, id, ETH / 100);
        let (voucher_id, _) = f.ledger.issue_voucher(p, 990).unwrap();

        assert!(matches!(
            f.ledger.refund_expired(&id, 1_001),
            Err(RelayError::Precondition(_))
        ));

        let events = f.ledger.refund_expired(&id, 1_040).unwrap();
        assert!(matches!(events[0], ProtocolEvent::VoucherSlashed { .. }));
        assert!(matches!(events[1], ProtocolEvent::RequestRefunded { .. }));
        assert!(f.ledger.voucher(&voucher_id).unwrap().slashed());
    }

    #[test]
    fn test_new_rejects_fee_rate_above_denominator() {
        let bad = ProtocolParams {
            protocol_fee_bps: 10_001,
            ..params()
        };
        let err = ExecutionLedger::new(SRC, bad, [DST].into_iter().collect()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_deliver_once_on_destination() {
        let mut dest = ExecutionLedger::new(DST, params(), [SRC].into_iter().collect()).unwrap();
        let relayer = Address::repeat_byte(0x33);
        dest.assets_mut()
            .mint(relayer, Address::NATIVE, 3 * ETH)
            .unwrap();
        let delivery = VoucherDelivery {
            voucher_id: Hash32::repeat_byte(1),
            request_id: Hash32::repeat_byte(2),
            source_chain_id: SRC,
            recipient: Address::repeat_byte(0x22),
            token: Address::NATIVE,
            amount: ETH,
            gas: ETH / 100,
        };
        dest.deliver_voucher(relayer, delivery.clone(), 10).unwrap();
        assert_eq!(
            dest.assets()
                .balance_of(&Address::repeat_byte(0x22), &Address::NATIVE),
            ETH + ETH / 100
        );
        assert!(matches!(
            dest.deliver_voucher(relayer, delivery, 11),
            Err(RelayError::Precondition(_))
        ));
    }

    #[test]
    fn test_third_party_payout_does_not_block_holder() {
        let mut dest = ExecutionLedger::new(DST, params(), [SRC].into_iter().collect()).unwrap();
        let holder = Address::repeat_byte(0x33);
        let griefer = Address::repeat_byte(0x66);
        dest.assets_mut()
            .mint(holder, Address::NATIVE, 2 * ETH)
            .unwrap();
        dest.assets_mut().mint(griefer, Address::NATIVE, 1).unwrap();
        let delivery = VoucherDelivery {
            voucher_id: Hash32::repeat_byte(1),
            request_id: Hash32::repeat_byte(2),
            source_chain_id: SRC,
            recipient: Address::repeat_byte(0x22),
            token: Address::NATIVE,
            amount: ETH,
            gas: 0,
        };

        let dust = VoucherDelivery {
            amount: 1,
            recipient: Address::repeat_byte(0x77),
            ..delivery.clone()
        };
        dest.deliver_voucher(griefer, dust, 10).unwrap();
        dest.deliver_voucher(holder, delivery.clone(), 11).unwrap();

        let record = dest.delivery(&delivery.voucher_id, &holder).unwrap();
        assert_eq!(record.delivery, delivery);
        assert_eq!(record.delivered_block, 11);
        assert_eq!(
            dest.delivery(&delivery.voucher_id, &griefer)
                .unwrap()
                .delivery
                .amount,
            1
        );
    }

    #[test]
    fn test_open_requests_listing() {
        let mut f = fixture();
        let a = create(&mut f, 100);
        let b = create(&mut f, 101);
        let p = bid(&f, &f.relayer, a, ETH / 100);
        f.ledger.issue_voucher(p, 102).unwrap();
        let open: Vec<Hash32> = f
            .ledger
            .open_requests(103)
            .iter()
            .map(|r| r.request_id)
            .collect();
        assert_eq!(open, vec![b]);
        // voucher on `a` goes stale
        assert_eq!(f.ledger.open_requests(152).len(), 2);
    }
}
