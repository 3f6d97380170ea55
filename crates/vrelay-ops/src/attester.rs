//! Attester flow: watch the destination chain for a voucher's payout and
//! report the verdict to the source chain.
//!
//! A matching delivery becomes a `Delivered` attestation submitted through
//! `mark_fulfilled`. A missing or wrong delivery behind a fulfilled voucher is
//! challenged with an `Invalid` attestation while the dispute window is open.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vrelay_chain::{ChainCall, Receipt, TxRequest};
use vrelay_crypto::{ids, sign_digest, KeyPair};
use vrelay_ledger::SlashEvidence;
use vrelay_types::{
    Address, BlockNumber, ChainId, DeliveryAttestation, DeliveryVerdict, EventFilter, EventKind,
    Hash32, LoggedEvent, ProtocolEvent, RecoverableSignature, RelayError, Result,
};

use crate::orchestrator::{OperationType, Orchestrator, WaitOutcome};
use crate::relayer::OpenRequest;

/// A signed verdict, and the `mark_fulfilled` receipt when it was `Delivered`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attested {
    pub attestation: DeliveryAttestation,
    pub signature: RecoverableSignature,
    pub receipt: Option<Receipt>,
}

pub struct AttesterAgent {
    key: KeyPair,
    orch: Arc<Orchestrator>,
}

impl AttesterAgent {
    pub fn new(key: KeyPair, orch: Arc<Orchestrator>) -> Self {
        Self { key, orch }
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    /// Request terms behind a voucher and the relayer holding it, from the
    /// source chain's log.
    async fn terms(
        &self,
        source_chain_id: ChainId,
        voucher_id: Hash32,
    ) -> Result<(OpenRequest, Address)> {
        let issued = self
            .orch
            .find_event(
                source_chain_id,
                &EventFilter::kind(EventKind::VoucherIssued).with_voucher(voucher_id),
            )
            .await?
            .ok_or_else(|| {
                RelayError::Precondition(format!(
                    "voucher {} not issued on chain {}",
                    voucher_id, source_chain_id
                ))
            })?;
        let (request_id, relayer) = match issued.event {
            ProtocolEvent::VoucherIssued {
                request_id,
                relayer,
                ..
            } => (request_id, relayer),
            _ => return Err(RelayError::Other("expected a VoucherIssued event".into())),
        };

        let created = self
            .orch
            .find_event(
                source_chain_id,
                &EventFilter::kind(EventKind::RequestCreated).with_request(request_id),
            )
            .await?
            .ok_or_else(|| {
                RelayError::Precondition(format!("request {} not found", request_id))
            })?;
        let terms = OpenRequest::from_event(&created)
            .ok_or_else(|| RelayError::Other("malformed RequestCreated event".into()))?;
        Ok((terms, relayer))
    }

    fn sign(&self, attestation: &DeliveryAttestation) -> Result<RecoverableSignature> {
        sign_digest(&self.key, &ids::attestation_digest(attestation))
    }

    /// Wait for the voucher's payout on the destination chain and attest to it.
    #[tracing::instrument(skip_all, fields(voucher_id = %voucher_id))]
    pub async fn attest_delivery(
        &self,
        source_chain_id: ChainId,
        voucher_id: Hash32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome<Attested>> {
        let (terms, relayer) = self.terms(source_chain_id, voucher_id).await?;
        let delivered = match self
            .orch
            .wait_for_event(
                terms.destination_chain_id,
                EventFilter::kind(EventKind::VoucherDelivered)
                    .with_voucher(voucher_id)
                    .with_relayer(relayer),
                0,
                timeout,
                cancel,
            )
            .await?
        {
            WaitOutcome::Ready(event) => event,
            WaitOutcome::TimedOut => return Ok(WaitOutcome::TimedOut),
            WaitOutcome::Cancelled => return Ok(WaitOutcome::Cancelled),
        };

        let attestation = judge(
            &terms,
            voucher_id,
            relayer,
            Some(&delivered),
            delivered.block_number,
        );
        let signature = self.sign(&attestation)?;

        let receipt = if attestation.verdict == DeliveryVerdict::Delivered {
            let receipt = self
                .orch
                .submit(
                    OperationType::MarkFulfilled,
                    source_chain_id,
                    TxRequest::new(
                        self.address(),
                        ChainCall::MarkFulfilled {
                            attestation: attestation.clone(),
                            signature,
                        },
                    ),
                )
                .await?;
            info!(%voucher_id, "delivery attested");
            Some(receipt)
        } else {
            warn!(%voucher_id, "delivery does not match voucher terms");
            None
        };

        Ok(WaitOutcome::Ready(Attested {
            attestation,
            signature,
            receipt,
        }))
    }

    /// Dispute a fulfilled voucher whose payout is missing or wrong.
    #[tracing::instrument(skip_all, fields(voucher_id = %voucher_id))]
    pub async fn challenge_delivery(
        &self,
        source_chain_id: ChainId,
        voucher_id: Hash32,
    ) -> Result<Receipt> {
        let (terms, relayer) = self.terms(source_chain_id, voucher_id).await?;
        let destination = terms.destination_chain_id;
        let delivered = self
            .orch
            .find_event(
                destination,
                &EventFilter::kind(EventKind::VoucherDelivered)
                    .with_voucher(voucher_id)
                    .with_relayer(relayer),
            )
            .await?;
        let observed_block = self.orch.block_number(destination).await?;

        let attestation = judge(
            &terms,
            voucher_id,
            relayer,
            delivered.as_ref(),
            observed_block,
        );
        if attestation.verdict == DeliveryVerdict::Delivered {
            return Err(RelayError::Precondition(format!(
                "delivery of voucher {} matches its terms",
                voucher_id
            )));
        }
        let signature = self.sign(&attestation)?;

        let receipt = self
            .orch
            .submit(
                OperationType::Challenge,
                source_chain_id,
                TxRequest::new(
                    self.address(),
                    ChainCall::Slash {
                        voucher_id,
                        evidence: SlashEvidence::Fraud {
                            attestation,
                            signature,
                        },
                    },
                ),
            )
            .await?;
        info!(%voucher_id, "fraudulent fulfillment challenged");
        Ok(receipt)
    }
}

/// `Delivered` only for a payout by the voucher's `relayer` that matches the
/// request in every field.
fn judge(
    terms: &OpenRequest,
    voucher_id: Hash32,
    relayer: Address,
    delivered: Option<&LoggedEvent>,
    observed_block: BlockNumber,
) -> DeliveryAttestation {
    let honest = delivered.is_some_and(|logged| match &logged.event {
        ProtocolEvent::VoucherDelivered {
            voucher_id: delivered_voucher,
            request_id,
            source_chain_id,
            relayer: payer,
            recipient,
            token,
            amount,
            gas,
        } => {
            *delivered_voucher == voucher_id
                && *payer == relayer
                && *request_id == terms.request_id
                && *source_chain_id == terms.source_chain_id
                && *recipient == terms.recipient
                && *token == terms.destination_token
                && *amount == terms.amount
                && *gas >= terms.gas_on_destination
        }
        _ => false,
    });

    DeliveryAttestation {
        voucher_id,
        request_id: terms.request_id,
        destination_chain_id: terms.destination_chain_id,
        recipient: terms.recipient,
        amount: terms.amount,
        verdict: if honest {
            DeliveryVerdict::Delivered
        } else {
            DeliveryVerdict::Invalid
        },
        observed_block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayer::{IssuedVoucher, OpenRequest};
    use crate::testnet::{request, testnet, timeout, TestNet, DST, ETH, SRC};
    use vrelay_auction::BidPolicy;
    use vrelay_types::SlashReason;

    async fn issued(net: &TestNet, nonce: u64) -> IssuedVoucher {
        let created = net
            .user()
            .create_request(SRC, request(nonce, 1_000))
            .await
            .unwrap();
        let logged = net
            .orch
            .find_event(
                SRC,
                &EventFilter::kind(EventKind::RequestCreated).with_request(created.request_id),
            )
            .await
            .unwrap()
            .unwrap();
        let req = OpenRequest::from_event(&logged).unwrap();
        net.relayer(BidPolicy::default())
            .issue_voucher(&req, ETH / 100)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_matching_delivery_is_marked_fulfilled() {
        let net = testnet().await;
        let voucher = issued(&net, 1).await;
        net.relayer(BidPolicy::default())
            .deliver(&voucher)
            .await
            .unwrap();

        let attested = net
            .attester()
            .attest_delivery(SRC, voucher.voucher_id, timeout(), &CancellationToken::new())
            .await
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(attested.attestation.verdict, DeliveryVerdict::Delivered);
        let receipt = attested.receipt.unwrap();
        assert!(matches!(
            receipt.events[0].event,
            ProtocolEvent::VoucherFulfilled { claimable_at: 100, .. }
        ));

        // nothing to dispute
        let err = net
            .attester()
            .challenge_delivery(SRC, voucher.voucher_id)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_short_delivery_gets_invalid_verdict() {
        let net = testnet().await;
        let voucher = issued(&net, 2).await;
        let mut short = voucher.request.delivery(voucher.voucher_id);
        short.amount = ETH / 2;
        net.orch
            .submit(
                OperationType::Deliver,
                DST,
                TxRequest::new(net.relayer_key.address(), ChainCall::DeliverVoucher(short)),
            )
            .await
            .unwrap();

        let attested = net
            .attester()
            .attest_delivery(SRC, voucher.voucher_id, timeout(), &CancellationToken::new())
            .await
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(attested.attestation.verdict, DeliveryVerdict::Invalid);
        assert!(attested.receipt.is_none());
        assert!(net
            .orch
            .find_event(SRC, &EventFilter::kind(EventKind::VoucherFulfilled))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_delivery_times_out() {
        let net = testnet().await;
        let voucher = issued(&net, 3).await;
        let out = net
            .attester()
            .attest_delivery(
                SRC,
                voucher.voucher_id,
                Duration::from_millis(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_false_fulfillment_is_challenged() {
        let net = testnet().await;
        let voucher = issued(&net, 4).await;

        // a colluding attester vouches for a payout that never happened
        let attestation = DeliveryAttestation {
            voucher_id: voucher.voucher_id,
            request_id: voucher.request.request_id,
            destination_chain_id: DST,
            recipient: voucher.request.recipient,
            amount: voucher.request.amount,
            verdict: DeliveryVerdict::Delivered,
            observed_block: 0,
        };
        let signature =
            sign_digest(&net.attester_key, &ids::attestation_digest(&attestation)).unwrap();
        net.orch
            .submit(
                OperationType::MarkFulfilled,
                SRC,
                TxRequest::new(
                    net.attester_key.address(),
                    ChainCall::MarkFulfilled {
                        attestation,
                        signature,
                    },
                ),
            )
            .await
            .unwrap();

        let receipt = net
            .attester()
            .challenge_delivery(SRC, voucher.voucher_id)
            .await
            .unwrap();
        assert!(receipt.events.iter().any(|e| matches!(
            e.event,
            ProtocolEvent::VoucherSlashed {
                reason: SlashReason::FraudProven,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_front_run_payout_does_not_shadow_holder_delivery() {
        let net = testnet().await;
        let voucher = issued(&net, 5).await;

        let griefer = Address::repeat_byte(0x66);
        net.dst.mint(griefer, Address::NATIVE, 1).unwrap();
        let mut dust = voucher.request.delivery(voucher.voucher_id);
        dust.amount = 1;
        dust.recipient = griefer;
        net.orch
            .submit(
                OperationType::Deliver,
                DST,
                TxRequest::new(griefer, ChainCall::DeliverVoucher(dust)),
            )
            .await
            .unwrap();

        net.relayer(BidPolicy::default())
            .deliver(&voucher)
            .await
            .unwrap();
        let attested = net
            .attester()
            .attest_delivery(SRC, voucher.voucher_id, timeout(), &CancellationToken::new())
            .await
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(attested.attestation.verdict, DeliveryVerdict::Delivered);
        assert!(attested.receipt.is_some());
    }

    #[test]
    fn test_judge_requires_every_field() {
        let terms = OpenRequest {
            request_id: Hash32::repeat_byte(1),
            source_chain_id: SRC,
            requester: Address::repeat_byte(0x11),
            source_token: Address::NATIVE,
            destination_token: Address::NATIVE,
            amount: ETH,
            destination_chain_id: DST,
            recipient: Address::repeat_byte(0x22),
            gas_on_destination: 10,
            max_fee: ETH / 10,
            fee_increment: ETH / 100,
            deadline: 1_000,
            created_block: 0,
        };
        let voucher_id = Hash32::repeat_byte(2);
        let holder = Address::repeat_byte(0x33);
        let delivered = |amount, gas| LoggedEvent {
            chain_id: DST,
            block_number: 7,
            tx_hash: Hash32::ZERO,
            log_index: 0,
            event: ProtocolEvent::VoucherDelivered {
                voucher_id,
                request_id: terms.request_id,
                source_chain_id: SRC,
                relayer: Address::repeat_byte(0x33),
                recipient: terms.recipient,
                token: Address::NATIVE,
                amount,
                gas,
            },
        };

        let ok = judge(&terms, voucher_id, holder, Some(&delivered(ETH, 12)), 7);
        assert_eq!(ok.verdict, DeliveryVerdict::Delivered);
        assert_eq!(ok.observed_block, 7);
        assert_eq!(
            judge(&terms, voucher_id, holder, Some(&delivered(ETH, 9)), 7).verdict,
            DeliveryVerdict::Invalid
        );
        assert_eq!(
            judge(&terms, voucher_id, holder, Some(&delivered(ETH - 1, 10)), 7).verdict,
            DeliveryVerdict::Invalid
        );
        // a matching payout by someone else is not the holder's delivery
        assert_eq!(
            judge(
                &terms,
                voucher_id,
                Address::repeat_byte(0x66),
                Some(&delivered(ETH, 12)),
                7
            )
            .verdict,
            DeliveryVerdict::Invalid
        );
        assert_eq!(
            judge(&terms, voucher_id, holder, None, 7).verdict,
            DeliveryVerdict::Invalid
        );
    }
}
