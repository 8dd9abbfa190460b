//! Payment Processor - direct consultation payments
//!
//! The lightweight escrow path: consultation funds sit in the treasury wallet
//! and are paid to the doctor over Lightning when a channel can carry them,
//! on-chain otherwise. Platform fees and deferred refunds go through the
//! [`PaymentQueue`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    amount::{apply_bps, apply_percent, btc_to_sats},
    config::{ProcessorConfig, SettlementPolicy},
    events::{EventBus, SettlementEvent},
    fees::DUST_THRESHOLD_SATS,
    lightning::LightningClient,
    models::{
        ConsultationEscrow, ConsultationEscrowStatus, PaymentMethod, PaymentOutcome, QueueItemType, Recipient,
    },
    queue::PaymentQueue,
    repository::PaymentRepository,
    scheduler::{Clock, ScheduledJob},
    wallet::WalletManager,
    SettlementError, SettlementResult,
};

/// Settles lightweight consultation escrows
pub struct PaymentProcessor {
    config: ProcessorConfig,
    policy: SettlementPolicy,
    wallets: Arc<WalletManager>,
    lightning: Option<Arc<dyn LightningClient>>,
    repo: Arc<dyn PaymentRepository>,
    queue: Arc<PaymentQueue>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl PaymentProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProcessorConfig,
        policy: SettlementPolicy,
        wallets: Arc<WalletManager>,
        lightning: Option<Arc<dyn LightningClient>>,
        repo: Arc<dyn PaymentRepository>,
        queue: Arc<PaymentQueue>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            "Initializing payment processor (lightning {})",
            if lightning.is_some() && config.enable_lightning {
                "enabled"
            } else {
                "disabled"
            }
        );
        Self {
            config,
            policy,
            wallets,
            lightning,
            repo,
            queue,
            events,
            clock,
        }
    }

    /// Create a lightweight escrow and settle it immediately
    pub async fn process_consultation_payment(
        &self,
        consultation_id: &str,
        patient_id: &str,
        doctor_id: &str,
        btc_amount: Decimal,
        is_urgent: bool,
    ) -> SettlementResult<PaymentOutcome> {
        let escrow = self
            .create_escrow(consultation_id, patient_id, doctor_id, btc_amount, is_urgent)
            .await?;
        self.execute_payment(escrow).await
    }

    /// Record a `pending` escrow; expiry is the urgent or normal window
    pub async fn create_escrow(
        &self,
        consultation_id: &str,
        patient_id: &str,
        doctor_id: &str,
        btc_amount: Decimal,
        is_urgent: bool,
    ) -> SettlementResult<ConsultationEscrow> {
        let amount_sats = btc_to_sats(btc_amount)?;
        if amount_sats < DUST_THRESHOLD_SATS {
            return Err(SettlementError::validation(format!(
                "Amount {} sats is below the dust threshold",
                amount_sats
            )));
        }
        if patient_id == doctor_id {
            return Err(SettlementError::validation("Patient and doctor must be different users"));
        }
        for user_id in [patient_id, doctor_id] {
            if self.wallets.get_wallet(user_id).await?.is_none() {
                return Err(SettlementError::not_found(format!("Wallet for {} not found", user_id)));
            }
        }

        let window_hours = if is_urgent {
            self.policy.urgent_window_hours
        } else {
            self.policy.normal_window_hours
        };
        let platform_fee_sats = apply_bps(amount_sats, self.policy.platform_fee_bps);
        let now = self.clock.now();
        let escrow = ConsultationEscrow {
            id: Uuid::new_v4(),
            consultation_id: consultation_id.to_string(),
            patient_id: patient_id.to_string(),
            doctor_id: doctor_id.to_string(),
            amount_sats,
            is_urgent,
            status: ConsultationEscrowStatus::Pending,
            payment_method: None,
            platform_fee_sats,
            doctor_amount_sats: amount_sats - platform_fee_sats,
            txid: None,
            payment_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ChronoDuration::hours(window_hours),
        };
        self.repo.insert_consultation_escrow(escrow.clone()).await?;

        info!(
            "Created consultation escrow {} for {}: {} sats{}",
            escrow.id,
            consultation_id,
            amount_sats,
            if is_urgent { " (urgent)" } else { "" }
        );
        Ok(escrow)
    }

    /// `pending -> processing -> completed|failed`: pay the doctor over
    /// Lightning, then on-chain.
    ///
    /// The stored escrow is claimed before any payment is attempted, so a
    /// repeated or concurrent call for the same escrow is rejected.
    pub async fn execute_payment(&self, escrow: ConsultationEscrow) -> SettlementResult<PaymentOutcome> {
        let escrow = self
            .transition(
                escrow.id,
                ConsultationEscrowStatus::Pending,
                ConsultationEscrowStatus::Processing,
            )
            .await?;

        match self.pay_doctor(&escrow).await {
            Ok(outcome) => {
                self.complete(
                    &escrow,
                    ConsultationEscrowStatus::Processing,
                    ConsultationEscrowStatus::Completed,
                    &outcome,
                )
                .await?;
                Ok(outcome)
            }
            Err(e) => {
                let now = self.clock.now();
                let reason = e.to_string();
                self.repo
                    .update_consultation_escrow_if(
                        escrow.id,
                        &[ConsultationEscrowStatus::Processing],
                        Box::new(move |esc| {
                            esc.status = ConsultationEscrowStatus::Failed;
                            esc.failure_reason = Some(reason);
                            esc.updated_at = now;
                        }),
                    )
                    .await?;
                error!("Payment for consultation {} failed on every rail: {}", escrow.consultation_id, e);
                self.events.emit(SettlementEvent::PaymentFailed {
                    reference: escrow.consultation_id.clone(),
                    item_type: None,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// `pending -> releasing -> released`, paying the doctor net of the fee
    pub async fn release_escrow(&self, escrow_id: Uuid) -> SettlementResult<PaymentOutcome> {
        let escrow = self
            .transition(
                escrow_id,
                ConsultationEscrowStatus::Pending,
                ConsultationEscrowStatus::Releasing,
            )
            .await?;

        match self.pay_doctor(&escrow).await {
            Ok(outcome) => {
                self.complete(
                    &escrow,
                    ConsultationEscrowStatus::Releasing,
                    ConsultationEscrowStatus::Released,
                    &outcome,
                )
                .await?;
                Ok(outcome)
            }
            Err(e) => {
                self.revert(&escrow, ConsultationEscrowStatus::Releasing, &e).await?;
                Err(e)
            }
        }
    }

    /// `pending -> refunding -> refunded`, returning the full amount on-chain
    pub async fn refund_escrow(&self, escrow_id: Uuid) -> SettlementResult<PaymentOutcome> {
        let escrow = self
            .transition(
                escrow_id,
                ConsultationEscrowStatus::Pending,
                ConsultationEscrowStatus::Refunding,
            )
            .await?;

        let result = async {
            let patient = self.wallet_address(&escrow.patient_id).await?;
            self.wallets
                .send(
                    &self.config.treasury_user_id,
                    &[Recipient::new(patient, escrow.amount_sats)],
                    None,
                )
                .await
        }
        .await;

        match result {
            Ok(signed) => {
                let now = self.clock.now();
                let txid = signed.txid.clone();
                self.repo
                    .update_consultation_escrow_if(
                        escrow_id,
                        &[ConsultationEscrowStatus::Refunding],
                        Box::new(move |esc| {
                            esc.status = ConsultationEscrowStatus::Refunded;
                            esc.payment_method = Some(PaymentMethod::Onchain);
                            esc.txid = Some(txid);
                            esc.platform_fee_sats = 0;
                            esc.doctor_amount_sats = 0;
                            esc.updated_at = now;
                        }),
                    )
                    .await?;
                info!("Refunded consultation escrow {} in {}", escrow_id, signed.txid);
                Ok(PaymentOutcome::onchain(signed.txid, signed.fee_sats))
            }
            Err(e) => {
                self.revert(&escrow, ConsultationEscrowStatus::Refunding, &e).await?;
                Err(e)
            }
        }
    }

    /// `pending -> disputed`
    pub async fn dispute_escrow(&self, escrow_id: Uuid) -> SettlementResult<ConsultationEscrow> {
        let escrow = self
            .transition(
                escrow_id,
                ConsultationEscrowStatus::Pending,
                ConsultationEscrowStatus::Disputed,
            )
            .await?;
        warn!("Consultation escrow {} disputed", escrow_id);
        Ok(escrow)
    }

    /// `disputed -> resolving -> resolved`: patient gets `refund_percent`,
    /// the doctor the rest net of the platform fee
    pub async fn handle_dispute_resolution(&self, escrow_id: Uuid, refund_percent: u8) -> SettlementResult<PaymentOutcome> {
        if refund_percent > 100 {
            return Err(SettlementError::validation(format!(
                "Refund percent {} is outside 0..=100",
                refund_percent
            )));
        }
        let escrow = self
            .transition(
                escrow_id,
                ConsultationEscrowStatus::Disputed,
                ConsultationEscrowStatus::Resolving,
            )
            .await?;

        let (patient_sats, doctor_sats, platform_fee_sats) =
            dispute_shares(escrow.amount_sats, refund_percent, self.policy.platform_fee_bps);

        let result = async {
            let mut recipients = Vec::with_capacity(2);
            if patient_sats >= DUST_THRESHOLD_SATS {
                recipients.push(Recipient::new(self.wallet_address(&escrow.patient_id).await?, patient_sats));
            }
            if doctor_sats >= DUST_THRESHOLD_SATS {
                recipients.push(Recipient::new(self.wallet_address(&escrow.doctor_id).await?, doctor_sats));
            }
            self.wallets
                .send(&self.config.treasury_user_id, &recipients, None)
                .await
        }
        .await;

        let signed = match result {
            Ok(signed) => signed,
            Err(e) => {
                self.revert(&escrow, ConsultationEscrowStatus::Resolving, &e).await?;
                return Err(e);
            }
        };

        let now = self.clock.now();
        let txid = signed.txid.clone();
        self.repo
            .update_consultation_escrow_if(
                escrow_id,
                &[ConsultationEscrowStatus::Resolving],
                Box::new(move |esc| {
                    esc.status = ConsultationEscrowStatus::Resolved;
                    esc.payment_method = Some(PaymentMethod::Onchain);
                    esc.txid = Some(txid);
                    esc.platform_fee_sats = platform_fee_sats;
                    esc.doctor_amount_sats = doctor_sats;
                    esc.updated_at = now;
                }),
            )
            .await?;
        self.enqueue_platform_fee(&escrow, platform_fee_sats).await;

        info!(
            "Resolved consultation escrow {}: patient {} sats, doctor {} sats",
            escrow_id, patient_sats, doctor_sats
        );
        Ok(PaymentOutcome::onchain(signed.txid, signed.fee_sats))
    }

    /// Expire stale `pending` escrows and queue full refunds
    pub async fn expire_escrows(&self) -> SettlementResult<usize> {
        let now = self.clock.now();
        let mut expired = 0;
        for escrow in self
            .repo
            .consultation_escrows_with_status(ConsultationEscrowStatus::Pending)
            .await?
        {
            if escrow.expires_at > now {
                continue;
            }
            let won = self
                .repo
                .update_consultation_escrow_if(
                    escrow.id,
                    &[ConsultationEscrowStatus::Pending],
                    Box::new(move |esc| {
                        esc.status = ConsultationEscrowStatus::Expired;
                        esc.updated_at = now;
                    }),
                )
                .await?;
            if won.is_none() {
                continue;
            }
            expired += 1;
            warn!("Consultation escrow {} expired, refunding patient", escrow.id);

            let refund = match self.wallet_address(&escrow.patient_id).await {
                Ok(address) => {
                    self.queue
                        .enqueue(
                            QueueItemType::ConsultationPayment,
                            &address,
                            escrow.amount_sats,
                            Some(escrow.id.to_string()),
                        )
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = refund {
                error!("Could not queue refund for expired escrow {}: {}", escrow.id, e);
            }
        }
        Ok(expired)
    }

    pub async fn get_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<ConsultationEscrow>> {
        self.repo.get_consultation_escrow(escrow_id).await
    }

    /// Lightning first; any Lightning failure falls back to on-chain
    async fn pay_doctor(&self, escrow: &ConsultationEscrow) -> SettlementResult<PaymentOutcome> {
        let amount = escrow.doctor_amount_sats;
        match self.pay_lightning(escrow, amount).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => warn!(
                "Lightning payment for {} unavailable, falling back to on-chain: {}",
                escrow.consultation_id, e
            ),
        }

        let doctor = self.wallet_address(&escrow.doctor_id).await?;
        let signed = self
            .wallets
            .send(
                &self.config.treasury_user_id,
                &[Recipient::new(doctor, amount)],
                None,
            )
            .await?;
        Ok(PaymentOutcome::onchain(signed.txid, signed.fee_sats))
    }

    async fn pay_lightning(&self, escrow: &ConsultationEscrow, amount_sats: u64) -> SettlementResult<PaymentOutcome> {
        let lightning = match (&self.lightning, self.config.enable_lightning) {
            (Some(lightning), true) => lightning,
            _ => return Err(SettlementError::network("Lightning is disabled")),
        };

        let balance = lightning.get_channel_balance().await?;
        if !balance.connected {
            return Err(SettlementError::network("Lightning node has no usable channels"));
        }
        if balance.outbound_sats < amount_sats {
            return Err(SettlementError::insufficient_funds(amount_sats, balance.outbound_sats));
        }

        let invoice = lightning
            .create_invoice(amount_sats, &format!("Consultation {}", escrow.consultation_id))
            .await?;
        let payment = lightning
            .pay_invoice(&invoice, Duration::from_secs(self.config.lightning_timeout_secs))
            .await?;
        Ok(PaymentOutcome::lightning(payment.payment_hash, payment.fee_sats))
    }

    /// Commit a successful doctor payment and queue the platform fee
    async fn complete(
        &self,
        escrow: &ConsultationEscrow,
        from: ConsultationEscrowStatus,
        to: ConsultationEscrowStatus,
        outcome: &PaymentOutcome,
    ) -> SettlementResult<()> {
        let now = self.clock.now();
        let recorded = outcome.clone();
        self.repo
            .update_consultation_escrow_if(
                escrow.id,
                &[from],
                Box::new(move |esc| {
                    esc.status = to;
                    esc.payment_method = recorded.payment_method;
                    esc.txid = recorded.txid;
                    esc.payment_hash = recorded.payment_hash;
                    esc.updated_at = now;
                }),
            )
            .await?
            .ok_or_else(|| SettlementError::internal(format!("Escrow {} changed during payment", escrow.id)))?;

        let method = outcome.payment_method.unwrap_or(PaymentMethod::Onchain);
        info!(
            "Paid {} sats for consultation {} via {}",
            escrow.doctor_amount_sats, escrow.consultation_id, method
        );
        self.events.emit(SettlementEvent::PaymentCompleted {
            escrow_id: escrow.id,
            method,
            reference: outcome
                .txid
                .clone()
                .or_else(|| outcome.payment_hash.clone())
                .unwrap_or_default(),
        });
        self.enqueue_platform_fee(escrow, escrow.platform_fee_sats).await;
        Ok(())
    }

    async fn enqueue_platform_fee(&self, escrow: &ConsultationEscrow, fee_sats: u64) {
        if self.config.platform_fee_address.is_empty() || fee_sats < DUST_THRESHOLD_SATS {
            return;
        }
        if let Err(e) = self
            .queue
            .enqueue(
                QueueItemType::PlatformFee,
                &self.config.platform_fee_address,
                fee_sats,
                Some(escrow.id.to_string()),
            )
            .await
        {
            error!("Failed to queue platform fee for escrow {}: {}", escrow.id, e);
        }
    }

    async fn revert(
        &self,
        escrow: &ConsultationEscrow,
        from: ConsultationEscrowStatus,
        err: &SettlementError,
    ) -> SettlementResult<()> {
        let back_to = match from {
            ConsultationEscrowStatus::Resolving => ConsultationEscrowStatus::Disputed,
            _ => ConsultationEscrowStatus::Pending,
        };
        let now = self.clock.now();
        self.repo
            .update_consultation_escrow_if(
                escrow.id,
                &[from],
                Box::new(move |esc| {
                    esc.status = back_to;
                    esc.updated_at = now;
                }),
            )
            .await?;
        warn!("Escrow {} payout failed, back to {:?}: {}", escrow.id, back_to, err);
        self.events.emit(SettlementEvent::PaymentFailed {
            reference: escrow.consultation_id.clone(),
            item_type: None,
            error: err.to_string(),
        });
        Ok(())
    }

    /// Guarded single-step transition; terminal and in-flight states are refused
    async fn transition(
        &self,
        escrow_id: Uuid,
        from: ConsultationEscrowStatus,
        to: ConsultationEscrowStatus,
    ) -> SettlementResult<ConsultationEscrow> {
        let escrow = self
            .repo
            .get_consultation_escrow(escrow_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("Escrow {} not found", escrow_id)))?;

        let reject = |reason: &str| {
            SettlementError::state_transition(format!("{:?}", escrow.status), format!("{:?}", to), reason.to_string())
        };
        if escrow.status.is_terminal() {
            return Err(reject("Escrow is already settled"));
        }
        if escrow.status.is_in_flight() {
            return Err(reject("A payout for this escrow is in progress"));
        }
        if escrow.status != from {
            return Err(reject("Invalid escrow transition"));
        }

        let now = self.clock.now();
        self.repo
            .update_consultation_escrow_if(
                escrow_id,
                &[from],
                Box::new(move |esc| {
                    esc.status = to;
                    esc.updated_at = now;
                }),
            )
            .await?
            .ok_or_else(|| reject("Escrow changed concurrently"))
    }

    async fn wallet_address(&self, user_id: &str) -> SettlementResult<String> {
        self.wallets
            .get_wallet(user_id)
            .await?
            .map(|w| w.address)
            .ok_or_else(|| SettlementError::not_found(format!("Wallet for {} not found", user_id)))
    }
}

/// Patient, doctor and platform shares of a resolved lightweight escrow.
///
/// The doctor's part carries the platform fee. A party share below dust is
/// paid to the other party so every sat of the escrow lands in an output or
/// the platform fee.
fn dispute_shares(amount_sats: u64, refund_percent: u8, platform_fee_bps: u32) -> (u64, u64, u64) {
    let mut patient = apply_percent(amount_sats, refund_percent);
    let remainder = amount_sats - patient;
    let platform_fee = apply_bps(remainder, platform_fee_bps);
    let mut doctor = remainder - platform_fee;

    if patient > 0 && patient < DUST_THRESHOLD_SATS {
        debug!("Patient share of {} sats is dust, paying it to the doctor", patient);
        doctor += patient;
        patient = 0;
    }
    if doctor > 0 && doctor < DUST_THRESHOLD_SATS {
        debug!("Doctor share of {} sats is dust, paying it to the patient", doctor);
        patient += doctor;
        doctor = 0;
    }
    (patient, doctor, platform_fee)
}

/// Periodic expiry of unsettled lightweight escrows
pub struct EscrowExpiryJob(pub Arc<PaymentProcessor>);

#[async_trait]
impl ScheduledJob for EscrowExpiryJob {
    fn name(&self) -> &'static str {
        "escrow_expiry"
    }

    async fn run(&self) -> SettlementResult<usize> {
        self.0.expire_escrows().await
    }
}
