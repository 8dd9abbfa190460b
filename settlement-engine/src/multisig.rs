//! Multisig Escrow - 2-of-3 P2WSH escrows with arbitrated disputes
//!
//! Funds are locked to a witness script over the patient, doctor and one
//! configured arbitrator. Release is signed by doctor + arbitrator, refund by
//! patient + arbitrator. Every status change is a compare-and-set in the
//! [`EscrowRepository`]; payouts hold the transient `settling` status while
//! the transaction is built and broadcast and revert it on failure.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    consensus::encode::serialize_hex,
    hashes::Hash,
    opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2, OP_PUSHNUM_3},
    script::Builder,
    secp256k1::{All, PublicKey, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, ScriptBuf, Transaction, TxOut, Witness,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    amount::{apply_bps, apply_percent, btc_to_sats, sats_to_btc},
    chain::ChainBackend,
    config::{EscrowConfig, SettlementPolicy},
    events::{EventBus, SettlementEvent},
    fees::{estimate_fee, InputKind, DUST_THRESHOLD_SATS},
    models::{
        ArbitratorVote, Dispute, DisputeResolution, EscrowParty, EscrowStatus, MultisigEscrow, Payout,
        PaymentOutcome, QueueItemType, ResolutionOutcome, ResolvedBy, VoteDecision,
    },
    queue::PaymentQueue,
    repository::EscrowRepository,
    scheduler::{Clock, ScheduledJob},
    wallet::{to_txin, SigningKey, WalletManager},
    SettlementError, SettlementResult,
};

/// How escrowed funds leave the script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Release,
    Refund { refund_percent: u8 },
}

impl From<ResolutionOutcome> for Disposition {
    fn from(outcome: ResolutionOutcome) -> Self {
        match outcome {
            ResolutionOutcome::ReleaseToDoctor => Self::Release,
            ResolutionOutcome::RefundToPatient { refund_percent } => Self::Refund { refund_percent },
        }
    }
}

/// What the patient needs to fund an escrow
#[derive(Debug, Clone, Serialize)]
pub struct FundingInstructions {
    pub escrow_id: Uuid,
    pub address: String,
    pub amount_sats: u64,
    pub amount_btc: Decimal,
    pub expires_at: DateTime<Utc>,
    pub instructions: String,
}

struct Arbitrator {
    id: String,
    secret: SecretKey,
    public: PublicKey,
    payout_address: String,
}

/// Creates, funds, settles and arbitrates 2-of-3 escrows
pub struct MultisigEscrowManager {
    config: EscrowConfig,
    policy: SettlementPolicy,
    arbitrators: Vec<Arbitrator>,
    wallets: Arc<WalletManager>,
    chain: Arc<dyn ChainBackend>,
    repo: Arc<dyn EscrowRepository>,
    queue: Arc<PaymentQueue>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    secp: Secp256k1<All>,
}

impl MultisigEscrowManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EscrowConfig,
        policy: SettlementPolicy,
        wallets: Arc<WalletManager>,
        chain: Arc<dyn ChainBackend>,
        repo: Arc<dyn EscrowRepository>,
        queue: Arc<PaymentQueue>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> SettlementResult<Self> {
        config.validate(&policy)?;
        let secp = Secp256k1::new();
        let mut arbitrators = Vec::with_capacity(config.arbitrators.len());
        for arbitrator in &config.arbitrators {
            let secret = SecretKey::from_str(arbitrator.secret_key.trim()).map_err(|e| {
                SettlementError::config(format!("Arbitrator {} has an invalid secret key: {}", arbitrator.id, e))
            })?;
            wallets.policy().parse_address(&arbitrator.payout_address)?;
            arbitrators.push(Arbitrator {
                id: arbitrator.id.clone(),
                public: secret.public_key(&secp),
                secret,
                payout_address: arbitrator.payout_address.clone(),
            });
        }
        wallets.policy().parse_address(&config.platform_fee_address)?;

        info!("Initializing multisig escrow manager with {} arbitrators", arbitrators.len());
        Ok(Self {
            config,
            policy,
            arbitrators,
            wallets,
            chain,
            repo,
            queue,
            events,
            clock,
            secp,
        })
    }

    /// Lock a consultation amount into a fresh 2-of-3 address
    pub async fn create_escrow(
        &self,
        consultation_id: &str,
        patient_address: &str,
        doctor_address: &str,
        amount_btc: Decimal,
        timeout_hours: Option<i64>,
    ) -> SettlementResult<FundingInstructions> {
        let amount_sats = btc_to_sats(amount_btc)?;
        if amount_sats > self.config.max_escrow_sats {
            return Err(SettlementError::validation(format!(
                "Amount {} sats exceeds maximum {}",
                amount_sats, self.config.max_escrow_sats
            )));
        }
        if amount_sats < DUST_THRESHOLD_SATS * 10 {
            return Err(SettlementError::validation(format!(
                "Amount {} sats is too small to escrow",
                amount_sats
            )));
        }
        let timeout_hours = timeout_hours.unwrap_or(self.config.default_timeout_hours);
        if timeout_hours <= 0 {
            return Err(SettlementError::validation("Escrow timeout must be positive"));
        }

        let policy = self.wallets.policy();
        let patient_address = policy.parse_address(patient_address)?.to_string();
        let doctor_address = policy.parse_address(doctor_address)?.to_string();
        if patient_address == doctor_address {
            return Err(SettlementError::validation("Patient and doctor must be different parties"));
        }

        let patient_key = self.wallets.public_key_for_address(&patient_address).await?;
        let doctor_key = self.wallets.public_key_for_address(&doctor_address).await?;
        let arbitrator = &self.arbitrators[policy.select_arbitrator(self.arbitrators.len())?];

        let script = multisig_witness_script([patient_key, doctor_key, arbitrator.public]);
        let address = Address::p2wsh(&script, policy.network()).to_string();

        let now = self.clock.now();
        let escrow = MultisigEscrow {
            id: Uuid::new_v4(),
            consultation_id: consultation_id.to_string(),
            patient: EscrowParty {
                address: patient_address,
                public_key: hex::encode(patient_key.serialize()),
            },
            doctor: EscrowParty {
                address: doctor_address,
                public_key: hex::encode(doctor_key.serialize()),
            },
            arbitrator_id: arbitrator.id.clone(),
            arbitrator_public_key: hex::encode(arbitrator.public.serialize()),
            amount_sats,
            address: address.clone(),
            witness_script: hex::encode(script.as_bytes()),
            status: EscrowStatus::Created,
            funding_txid: None,
            release_txid: None,
            refund_txid: None,
            payout: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(timeout_hours),
            funded_at: None,
            settled_at: None,
        };
        self.repo.insert_escrow(escrow.clone()).await?;

        info!(
            "Created escrow {} for consultation {}: {} sats at {} (arbitrator {})",
            escrow.id, consultation_id, amount_sats, address, escrow.arbitrator_id
        );

        let amount_btc = sats_to_btc(amount_sats);
        Ok(FundingInstructions {
            escrow_id: escrow.id,
            instructions: format!(
                "Send exactly {} BTC ({} sats) to {} before {}",
                amount_btc,
                amount_sats,
                address,
                escrow.expires_at.to_rfc3339()
            ),
            address,
            amount_sats,
            amount_btc,
            expires_at: escrow.expires_at,
        })
    }

    /// Check the escrow address and advance `created` to `funded` or `expired`
    pub async fn monitor_funding(&self, escrow_id: Uuid) -> SettlementResult<EscrowStatus> {
        let escrow = self.require_escrow(escrow_id).await?;
        if escrow.status != EscrowStatus::Created {
            return Ok(escrow.status);
        }

        let balance = self.chain.get_balance(&escrow.address).await?;
        let now = self.clock.now();

        if balance.confirmed_sats >= escrow.amount_sats {
            let funding_txid = match self.chain.get_utxos(&escrow.address).await {
                Ok(utxos) => utxos.into_iter().find(|u| u.confirmations > 0).map(|u| u.txid),
                Err(e) => {
                    debug!("Could not read funding outputs of {}: {}", escrow.address, e);
                    None
                }
            };

            let txid = funding_txid.clone();
            let won = self
                .repo
                .update_escrow_if(
                    escrow_id,
                    &[EscrowStatus::Created],
                    Box::new(move |e| {
                        e.status = EscrowStatus::Funded;
                        e.funding_txid = txid;
                        e.funded_at = Some(now);
                        e.updated_at = now;
                    }),
                )
                .await?;

            return match won {
                Some(funded) => {
                    info!("Escrow {} funded with {} sats", escrow_id, balance.confirmed_sats);
                    self.events.emit(SettlementEvent::EscrowFunded {
                        escrow_id,
                        consultation_id: funded.consultation_id,
                        amount_sats: funded.amount_sats,
                        txid: funding_txid,
                    });
                    Ok(EscrowStatus::Funded)
                }
                None => Ok(self.require_escrow(escrow_id).await?.status),
            };
        }

        if now >= escrow.expires_at {
            let won = self
                .repo
                .update_escrow_if(
                    escrow_id,
                    &[EscrowStatus::Created],
                    Box::new(move |e| {
                        e.status = EscrowStatus::Expired;
                        e.updated_at = now;
                    }),
                )
                .await?;
            if won.is_some() {
                warn!("Escrow {} expired unfunded", escrow_id);
                self.events.emit(SettlementEvent::EscrowExpired { escrow_id });
                return Ok(EscrowStatus::Expired);
            }
            return Ok(self.require_escrow(escrow_id).await?.status);
        }

        Ok(EscrowStatus::Created)
    }

    /// One funding pass over every `created` escrow; returns how many moved
    pub async fn monitor_all(&self) -> SettlementResult<usize> {
        let pending = self.repo.escrows_with_status(EscrowStatus::Created).await?;
        let mut transitioned = 0;
        for escrow in pending {
            match self.monitor_funding(escrow.id).await {
                Ok(EscrowStatus::Created) => {}
                Ok(_) => transitioned += 1,
                Err(e) => warn!("Funding check for escrow {} failed: {}", escrow.id, e),
            }
        }
        Ok(transitioned)
    }

    /// Pay the doctor net of the platform fee (doctor + arbitrator sign)
    pub async fn release_to_doctor(&self, escrow_id: Uuid) -> SettlementResult<PaymentOutcome> {
        let settled = self
            .settle(
                escrow_id,
                Disposition::Release,
                &[EscrowStatus::Funded, EscrowStatus::Disputed],
                EscrowStatus::Released,
            )
            .await?;
        self.close_open_dispute(&settled, ResolutionOutcome::ReleaseToDoctor).await?;
        Ok(settlement_outcome(&settled))
    }

    /// Return `refund_percent` of the amount to the patient (patient + arbitrator sign)
    pub async fn refund_to_patient(&self, escrow_id: Uuid, refund_percent: u8) -> SettlementResult<PaymentOutcome> {
        if refund_percent > 100 {
            return Err(SettlementError::validation(format!(
                "Refund percent {} is outside 0..=100",
                refund_percent
            )));
        }
        let settled = self
            .settle(
                escrow_id,
                Disposition::Refund { refund_percent },
                &[EscrowStatus::Funded, EscrowStatus::Disputed],
                EscrowStatus::Refunded,
            )
            .await?;
        self.close_open_dispute(&settled, ResolutionOutcome::RefundToPatient { refund_percent })
            .await?;
        Ok(settlement_outcome(&settled))
    }

    /// Open a dispute against a funded escrow
    pub async fn initiate_dispute(&self, escrow_id: Uuid, initiator: &str, reason: &str) -> SettlementResult<Dispute> {
        if reason.trim().is_empty() {
            return Err(SettlementError::validation("Dispute reason cannot be empty"));
        }
        let escrow = self.require_escrow(escrow_id).await?;
        if !self.is_party(&escrow, initiator).await? {
            return Err(SettlementError::dispute(format!(
                "{} is not a party to escrow {}",
                initiator, escrow_id
            )));
        }
        if !escrow.status.can_dispute() {
            return Err(SettlementError::state_transition(
                format!("{:?}", escrow.status),
                format!("{:?}", EscrowStatus::Disputed),
                "Only funded escrows can be disputed".to_string(),
            ));
        }

        let now = self.clock.now();
        self.repo
            .update_escrow_if(
                escrow_id,
                &[EscrowStatus::Funded],
                Box::new(move |e| {
                    e.status = EscrowStatus::Disputed;
                    e.updated_at = now;
                }),
            )
            .await?
            .ok_or_else(|| {
                SettlementError::state_transition(
                    "Funded".to_string(),
                    "Disputed".to_string(),
                    "Escrow changed concurrently".to_string(),
                )
            })?;

        let dispute = Dispute::new(
            escrow_id,
            initiator.to_string(),
            reason.trim().to_string(),
            now,
            now + Duration::hours(self.policy.dispute_window_hours),
        );

        if let Err(e) = self.repo.insert_dispute(dispute.clone()).await {
            self.set_status(escrow_id, EscrowStatus::Disputed, EscrowStatus::Funded).await?;
            return Err(e);
        }

        info!(
            "Dispute {} opened on escrow {} by {} (deadline {})",
            dispute.id, escrow_id, initiator, dispute.deadline
        );
        self.events.emit(SettlementEvent::DisputeInitiated {
            dispute_id: dispute.id,
            escrow_id,
            initiator: dispute.initiator.clone(),
        });
        Ok(dispute)
    }

    /// Record one arbitrator's vote; resolves once enough votes are in
    pub async fn submit_arbitrator_vote(
        &self,
        dispute_id: Uuid,
        arbitrator_id: &str,
        decision: VoteDecision,
        recommended_split: Option<u8>,
    ) -> SettlementResult<Dispute> {
        if !self.arbitrators.iter().any(|a| a.id == arbitrator_id) {
            return Err(SettlementError::dispute(format!(
                "{} is not a configured arbitrator",
                arbitrator_id
            )));
        }
        let recommended_split = match (decision, recommended_split) {
            (VoteDecision::Split, Some(percent)) if percent <= 100 => Some(percent),
            (VoteDecision::Split, Some(percent)) => {
                return Err(SettlementError::validation(format!(
                    "Recommended split {} is outside 0..=100",
                    percent
                )))
            }
            (VoteDecision::Split, None) => {
                return Err(SettlementError::validation("Split votes need a recommended split"))
            }
            _ => None,
        };

        let vote = ArbitratorVote {
            arbitrator_id: arbitrator_id.to_string(),
            decision,
            recommended_split,
            cast_at: self.clock.now(),
        };
        let updated = self
            .repo
            .update_dispute(
                dispute_id,
                Box::new(move |d| {
                    if d.is_resolved() || d.resolving {
                        return Err(SettlementError::dispute(format!("Dispute {} is already resolved", d.id)));
                    }
                    if d.has_voted(&vote.arbitrator_id) {
                        return Err(SettlementError::dispute(format!(
                            "Arbitrator {} already voted on dispute {}",
                            vote.arbitrator_id, d.id
                        )));
                    }
                    d.votes.push(vote);
                    Ok(())
                }),
            )
            .await?;
        info!(
            "Arbitrator {} voted {:?} on dispute {} ({} votes)",
            arbitrator_id,
            decision,
            dispute_id,
            updated.votes.len()
        );

        if updated.votes.len() < self.policy.required_votes {
            return Ok(updated);
        }
        // The vote is recorded either way; a failed payout is retried by the sweep
        if let Err(e) = self.resolve_dispute(dispute_id).await {
            error!("Resolving dispute {} failed: {}", dispute_id, e);
        }
        self.require_dispute(dispute_id).await
    }

    /// Execute a dispute once it has enough votes or its deadline passed.
    /// Returns `None` when another caller already resolved or claimed it.
    pub async fn resolve_dispute(&self, dispute_id: Uuid) -> SettlementResult<Option<DisputeResolution>> {
        let dispute = self.require_dispute(dispute_id).await?;
        if dispute.is_resolved() || dispute.resolving {
            return Ok(None);
        }

        let now = self.clock.now();
        let resolved_by = if dispute.votes.len() >= self.policy.required_votes {
            ResolvedBy::Votes
        } else if now >= dispute.deadline {
            ResolvedBy::Timeout
        } else {
            return Err(SettlementError::dispute(format!(
                "Dispute {} needs {} votes or its deadline to pass",
                dispute_id, self.policy.required_votes
            )));
        };

        let claimed = match self
            .repo
            .update_dispute(
                dispute_id,
                Box::new(|d| {
                    if d.resolving || d.is_resolved() {
                        return Err(SettlementError::dispute("Dispute already claimed"));
                    }
                    d.resolving = true;
                    Ok(())
                }),
            )
            .await
        {
            Ok(d) => d,
            Err(SettlementError::Dispute(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let outcome = decide_outcome(&claimed.votes, &self.policy);
        let settled = match self
            .settle(
                claimed.escrow_id,
                outcome.into(),
                &[EscrowStatus::Disputed],
                EscrowStatus::Resolved,
            )
            .await
        {
            Ok(settled) => settled,
            Err(e) => {
                self.repo
                    .update_dispute(
                        dispute_id,
                        Box::new(|d| {
                            d.resolving = false;
                            Ok(())
                        }),
                    )
                    .await?;
                return Err(e);
            }
        };

        let arbitrator_fee_sats = if claimed.votes.is_empty() {
            0
        } else {
            apply_bps(settled.amount_sats, self.policy.arbitrator_fee_bps)
        };
        let resolution = DisputeResolution {
            outcome,
            resolved_by,
            txid: settled.release_txid.clone().or_else(|| settled.refund_txid.clone()),
            arbitrator_fee_sats,
            resolved_at: self.clock.now(),
        };
        let recorded = resolution.clone();
        self.repo
            .update_dispute(
                dispute_id,
                Box::new(move |d| {
                    d.resolution = Some(recorded);
                    d.resolving = false;
                    Ok(())
                }),
            )
            .await?;

        self.enqueue_arbitrator_fees(&claimed, arbitrator_fee_sats).await;

        info!(
            "Dispute {} resolved by {:?}: {:?}",
            dispute_id, resolution.resolved_by, resolution.outcome
        );
        self.events.emit(SettlementEvent::DisputeResolved {
            dispute_id,
            escrow_id: claimed.escrow_id,
            outcome,
        });
        Ok(Some(resolution))
    }

    /// Resolve every open dispute that is past its deadline or already has
    /// enough votes; returns how many were resolved
    pub async fn sweep_disputes(&self) -> SettlementResult<usize> {
        let now = self.clock.now();
        let mut resolved = 0;
        for dispute in self.repo.open_disputes().await? {
            let ready = now >= dispute.deadline || dispute.votes.len() >= self.policy.required_votes;
            if !ready || dispute.resolving {
                continue;
            }
            match self.resolve_dispute(dispute.id).await {
                Ok(Some(_)) => resolved += 1,
                Ok(None) => {}
                Err(e) => warn!("Sweep could not resolve dispute {}: {}", dispute.id, e),
            }
        }
        Ok(resolved)
    }

    pub async fn get_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<MultisigEscrow>> {
        self.repo.get_escrow(escrow_id).await
    }

    pub async fn get_dispute(&self, dispute_id: Uuid) -> SettlementResult<Option<Dispute>> {
        self.repo.get_dispute(dispute_id).await
    }

    pub async fn dispute_for_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<Dispute>> {
        self.repo.dispute_for_escrow(escrow_id).await
    }

    /// Claim the escrow, pay out, then commit or revert the claim
    async fn settle(
        &self,
        escrow_id: Uuid,
        disposition: Disposition,
        allowed_from: &[EscrowStatus],
        final_status: EscrowStatus,
    ) -> SettlementResult<MultisigEscrow> {
        let escrow = self.require_escrow(escrow_id).await?;
        if !allowed_from.contains(&escrow.status) {
            return Err(SettlementError::state_transition(
                format!("{:?}", escrow.status),
                format!("{:?}", final_status),
                "Escrow is not in a settleable state".to_string(),
            ));
        }
        escrow.validate_transition(EscrowStatus::Settling)?;

        let prior = escrow.status;
        let now = self.clock.now();
        let claimed = self
            .repo
            .update_escrow_if(
                escrow_id,
                &[prior],
                Box::new(move |e| {
                    e.status = EscrowStatus::Settling;
                    e.updated_at = now;
                }),
            )
            .await?
            .ok_or_else(|| {
                SettlementError::state_transition(
                    format!("{:?}", prior),
                    format!("{:?}", EscrowStatus::Settling),
                    "Escrow changed concurrently".to_string(),
                )
            })?;

        let (txid, payout) = match self.execute_payout(&claimed, disposition).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Payout for escrow {} failed, reverting to {:?}: {}", escrow_id, prior, e);
                self.set_status(escrow_id, EscrowStatus::Settling, prior).await?;
                return Err(e);
            }
        };

        let done_at = self.clock.now();
        let recorded_txid = txid.clone();
        let settled = self
            .repo
            .update_escrow_if(
                escrow_id,
                &[EscrowStatus::Settling],
                Box::new(move |e| {
                    e.status = final_status;
                    e.payout = Some(payout);
                    e.settled_at = Some(done_at);
                    e.updated_at = done_at;
                    match disposition {
                        Disposition::Release => e.release_txid = Some(recorded_txid),
                        Disposition::Refund { .. } => e.refund_txid = Some(recorded_txid),
                    }
                }),
            )
            .await?
            .ok_or_else(|| SettlementError::internal(format!("Escrow {} left settling during payout", escrow_id)))?;

        match disposition {
            Disposition::Release => {
                info!(
                    "Escrow {} released in {}: doctor {} sats, platform fee {} sats",
                    escrow_id, txid, payout.doctor_sats, payout.platform_fee_sats
                );
                self.events.emit(SettlementEvent::EscrowReleased {
                    escrow_id,
                    txid,
                    doctor_sats: payout.doctor_sats,
                    platform_fee_sats: payout.platform_fee_sats,
                });
            }
            Disposition::Refund { refund_percent } => {
                info!(
                    "Escrow {} refunded {}% in {}: patient {} sats, platform fee {} sats",
                    escrow_id, refund_percent, txid, payout.patient_sats, payout.platform_fee_sats
                );
                self.events.emit(SettlementEvent::EscrowRefunded {
                    escrow_id,
                    txid,
                    patient_sats: payout.patient_sats,
                    platform_fee_sats: payout.platform_fee_sats,
                });
            }
        }
        Ok(settled)
    }

    /// Build, sign and broadcast the spend of every escrow output
    async fn execute_payout(
        &self,
        escrow: &MultisigEscrow,
        disposition: Disposition,
    ) -> SettlementResult<(String, Payout)> {
        let script = ScriptBuf::from_bytes(
            hex::decode(&escrow.witness_script)
                .map_err(|_| SettlementError::internal(format!("Escrow {} has a corrupt witness script", escrow.id)))?,
        );
        let utxos = self.chain.get_utxos(&escrow.address).await?;
        let total_in: u64 = utxos.iter().map(|u| u.value_sats).sum();
        let fee_rate = self.wallets.fee_rate().await;
        let (payout, platform_output) = plan_payout(
            escrow.amount_sats,
            total_in,
            utxos.len(),
            disposition,
            self.policy.platform_fee_bps,
            fee_rate,
        )?;

        let policy = self.wallets.policy();
        let mut outputs = Vec::with_capacity(3);
        if payout.doctor_sats > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(payout.doctor_sats),
                script_pubkey: policy.parse_address(&escrow.doctor.address)?.script_pubkey(),
            });
        }
        if payout.patient_sats + payout.surplus_sats > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(payout.patient_sats + payout.surplus_sats),
                script_pubkey: policy.parse_address(&escrow.patient.address)?.script_pubkey(),
            });
        }
        if platform_output > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(platform_output),
                script_pubkey: policy.parse_address(&self.config.platform_fee_address)?.script_pubkey(),
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos.iter().map(to_txin).collect::<SettlementResult<Vec<_>>>()?,
            output: outputs,
        };

        let party = match disposition {
            Disposition::Release => &escrow.doctor,
            Disposition::Refund { .. } => &escrow.patient,
        };
        let party_key = self.wallets.signing_key_for_address(&party.address).await?;
        if hex::encode(party_key.public_key().serialize()) != party.public_key {
            return Err(SettlementError::key_mismatch(format!(
                "Wallet key for {} is not the escrow key",
                party.address
            )));
        }
        let arbitrator = self.arbitrator(&escrow.arbitrator_id)?;
        let mut signers = [party_key, SigningKey::new(&self.secp, arbitrator.secret)];
        // OP_CHECKMULTISIG expects signatures in script key order
        signers.sort_by_key(|k| k.public_key().serialize());

        let witnesses = {
            let mut cache = SighashCache::new(&tx);
            let mut witnesses = Vec::with_capacity(utxos.len());
            for (index, utxo) in utxos.iter().enumerate() {
                let sighash = cache
                    .p2wsh_signature_hash(index, &script, Amount::from_sat(utxo.value_sats), EcdsaSighashType::All)
                    .map_err(|e| SettlementError::crypto(format!("Sighash failed: {}", e)))?
                    .to_byte_array();
                let mut witness = Witness::new();
                witness.push(Vec::<u8>::new());
                for signer in &signers {
                    witness.push(signer.sign(&self.secp, sighash).serialize());
                }
                witness.push(script.as_bytes());
                witnesses.push(witness);
            }
            witnesses
        };
        drop(signers);

        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        let txid = self.chain.broadcast(&serialize_hex(&tx)).await?;
        debug!(
            "Escrow {} payout {} spends {} inputs, network fee {} sats",
            escrow.id,
            txid,
            utxos.len(),
            payout.network_fee_sats
        );
        Ok((txid, payout))
    }

    async fn enqueue_arbitrator_fees(&self, dispute: &Dispute, total_fee_sats: u64) {
        if dispute.votes.is_empty() || total_fee_sats == 0 {
            return;
        }
        let share = total_fee_sats / dispute.votes.len() as u64;
        if share < DUST_THRESHOLD_SATS {
            warn!(
                "Arbitrator fee share of {} sats for dispute {} is below dust, not paid",
                share, dispute.id
            );
            return;
        }
        for vote in &dispute.votes {
            let Ok(arbitrator) = self.arbitrator(&vote.arbitrator_id) else {
                continue;
            };
            if let Err(e) = self
                .queue
                .enqueue(
                    QueueItemType::ArbitratorFee,
                    &arbitrator.payout_address,
                    share,
                    Some(dispute.escrow_id.to_string()),
                )
                .await
            {
                error!("Failed to enqueue arbitrator fee for {}: {}", arbitrator.id, e);
            }
        }
    }

    /// A party-signed settlement while disputed closes the dispute
    async fn close_open_dispute(&self, escrow: &MultisigEscrow, outcome: ResolutionOutcome) -> SettlementResult<()> {
        let Some(dispute) = self.repo.dispute_for_escrow(escrow.id).await? else {
            return Ok(());
        };
        if dispute.is_resolved() {
            return Ok(());
        }
        let resolution = DisputeResolution {
            outcome,
            resolved_by: ResolvedBy::Manual,
            txid: escrow.release_txid.clone().or_else(|| escrow.refund_txid.clone()),
            arbitrator_fee_sats: 0,
            resolved_at: self.clock.now(),
        };
        self.repo
            .update_dispute(
                dispute.id,
                Box::new(move |d| {
                    d.resolution = Some(resolution);
                    d.resolving = false;
                    Ok(())
                }),
            )
            .await?;
        info!("Dispute {} closed by direct settlement of escrow {}", dispute.id, escrow.id);
        self.events.emit(SettlementEvent::DisputeResolved {
            dispute_id: dispute.id,
            escrow_id: escrow.id,
            outcome,
        });
        Ok(())
    }

    async fn set_status(&self, escrow_id: Uuid, from: EscrowStatus, to: EscrowStatus) -> SettlementResult<()> {
        let now = self.clock.now();
        self.repo
            .update_escrow_if(
                escrow_id,
                &[from],
                Box::new(move |e| {
                    e.status = to;
                    e.updated_at = now;
                }),
            )
            .await?;
        Ok(())
    }

    async fn is_party(&self, escrow: &MultisigEscrow, who: &str) -> SettlementResult<bool> {
        if who == escrow.patient.address || who == escrow.doctor.address {
            return Ok(true);
        }
        for party in [&escrow.patient, &escrow.doctor] {
            if self.wallets.user_for_address(&party.address).await?.as_deref() == Some(who) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn arbitrator(&self, arbitrator_id: &str) -> SettlementResult<&Arbitrator> {
        self.arbitrators
            .iter()
            .find(|a| a.id == arbitrator_id)
            .ok_or_else(|| SettlementError::config(format!("Arbitrator {} is no longer configured", arbitrator_id)))
    }

    async fn require_escrow(&self, escrow_id: Uuid) -> SettlementResult<MultisigEscrow> {
        self.repo
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("Escrow {} not found", escrow_id)))
    }

    async fn require_dispute(&self, dispute_id: Uuid) -> SettlementResult<Dispute> {
        self.repo
            .get_dispute(dispute_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("Dispute {} not found", dispute_id)))
    }
}

fn settlement_outcome(escrow: &MultisigEscrow) -> PaymentOutcome {
    let txid = escrow
        .release_txid
        .clone()
        .or_else(|| escrow.refund_txid.clone())
        .unwrap_or_default();
    PaymentOutcome::onchain(txid, escrow.payout.map(|p| p.network_fee_sats).unwrap_or(0))
}

/// `OP_2 <k1> <k2> <k3> OP_3 OP_CHECKMULTISIG` over lexicographically sorted keys
pub fn multisig_witness_script(keys: [PublicKey; 3]) -> ScriptBuf {
    let mut sorted = keys;
    sorted.sort_by_key(|k| k.serialize());
    sorted
        .iter()
        .fold(Builder::new().push_opcode(OP_PUSHNUM_2), |builder, key| {
            builder.push_key(&bitcoin::PublicKey::new(*key))
        })
        .push_opcode(OP_PUSHNUM_3)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Dispute outcome from the recorded votes
pub fn decide_outcome(votes: &[ArbitratorVote], policy: &SettlementPolicy) -> ResolutionOutcome {
    if votes.is_empty() {
        return ResolutionOutcome::RefundToPatient {
            refund_percent: policy.timeout_refund_percent,
        };
    }

    let splits: Vec<u32> = votes
        .iter()
        .filter(|v| v.decision == VoteDecision::Split)
        .filter_map(|v| v.recommended_split.map(u32::from))
        .collect();
    let for_patient = votes.iter().filter(|v| v.decision == VoteDecision::Patient).count();
    let for_doctor = votes.iter().filter(|v| v.decision == VoteDecision::Doctor).count();
    let any_split = votes.iter().any(|v| v.decision == VoteDecision::Split);

    if any_split || for_patient == for_doctor {
        let refund_percent = if splits.is_empty() {
            policy.tie_refund_percent
        } else {
            let count = splits.len() as u32;
            ((splits.iter().sum::<u32>() + count / 2) / count) as u8
        };
        ResolutionOutcome::RefundToPatient { refund_percent }
    } else if for_patient > for_doctor {
        ResolutionOutcome::RefundToPatient {
            refund_percent: policy.patient_win_refund_percent,
        }
    } else {
        ResolutionOutcome::ReleaseToDoctor
    }
}

/// Split the escrowed inputs between payees, platform and network fee.
///
/// Returns the payout breakdown and the platform output value. The platform
/// share pays the network fee; only when it cannot does the payee's share
/// shrink. Payee shares below dust stay with the platform, and overfunding
/// goes back to the patient.
pub(crate) fn plan_payout(
    amount_sats: u64,
    total_in_sats: u64,
    input_count: usize,
    disposition: Disposition,
    platform_fee_bps: u32,
    fee_rate: u64,
) -> SettlementResult<(Payout, u64)> {
    if input_count == 0 || total_in_sats < amount_sats {
        return Err(SettlementError::insufficient_funds(amount_sats, total_in_sats));
    }

    let mut surplus = total_in_sats - amount_sats;
    let (mut doctor, mut patient) = match disposition {
        Disposition::Release => (amount_sats - apply_bps(amount_sats, platform_fee_bps), 0),
        Disposition::Refund { refund_percent } => (0, apply_percent(amount_sats, refund_percent)),
    };

    if doctor < DUST_THRESHOLD_SATS {
        doctor = 0;
    }
    let mut folded_surplus = 0;
    if patient + surplus < DUST_THRESHOLD_SATS {
        patient = 0;
        folded_surplus = surplus;
        surplus = 0;
    }

    let platform_available = amount_sats - doctor - patient + folded_surplus;
    let payee_outputs = usize::from(doctor > 0) + usize::from(patient + surplus > 0);
    let fee_with_platform = estimate_fee(InputKind::P2wshMultisig, input_count, payee_outputs + 1, fee_rate);
    let fee_without_platform = estimate_fee(InputKind::P2wshMultisig, input_count, payee_outputs, fee_rate);

    let (platform_output, network_fee) = if platform_available >= fee_with_platform + DUST_THRESHOLD_SATS {
        (platform_available - fee_with_platform, fee_with_platform)
    } else if platform_available >= fee_without_platform {
        (0, platform_available)
    } else {
        let shortfall = fee_without_platform - platform_available;
        let payee = if doctor > 0 { &mut doctor } else { &mut patient };
        if *payee < shortfall + DUST_THRESHOLD_SATS {
            return Err(SettlementError::insufficient_funds(
                amount_sats + fee_without_platform,
                total_in_sats,
            ));
        }
        *payee -= shortfall;
        (0, fee_without_platform)
    };
    if doctor == 0 && patient + surplus == 0 && platform_output == 0 {
        return Err(SettlementError::validation(format!(
            "Payout of {} sats leaves no output above dust at {} sat/vB",
            amount_sats, fee_rate
        )));
    }

    Ok((
        Payout {
            doctor_sats: doctor,
            patient_sats: patient,
            platform_fee_sats: amount_sats - doctor - patient,
            network_fee_sats: network_fee,
            surplus_sats: surplus,
        },
        platform_output,
    ))
}

/// Periodic funding detection
pub struct FundingMonitorJob(pub Arc<MultisigEscrowManager>);

#[async_trait]
impl ScheduledJob for FundingMonitorJob {
    fn name(&self) -> &'static str {
        "funding_monitor"
    }

    async fn run(&self) -> SettlementResult<usize> {
        self.0.monitor_all().await
    }
}

/// Periodic dispute timeout sweep
pub struct DisputeSweepJob(pub Arc<MultisigEscrowManager>);

#[async_trait]
impl ScheduledJob for DisputeSweepJob {
    fn name(&self) -> &'static str {
        "dispute_sweep"
    }

    async fn run(&self) -> SettlementResult<usize> {
        self.0.sweep_disputes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{QueueItemStatus, WalletInfo},
        repository::PaymentRepository,
        testing::{key_address, Harness},
    };

    async fn funded_escrow(h: &Harness) -> (Uuid, WalletInfo, WalletInfo) {
        let patient = h.wallets.create_wallet("patient-1", None).await.unwrap();
        let doctor = h.wallets.create_wallet("doctor-1", None).await.unwrap();
        let funding = h
            .multisig
            .create_escrow(
                "consult-1",
                &patient.address,
                &doctor.address,
                Decimal::from_str("0.01").unwrap(),
                None,
            )
            .await
            .unwrap();
        h.chain.fund(&funding.address, funding.amount_sats);
        assert_eq!(
            h.multisig.monitor_funding(funding.escrow_id).await.unwrap(),
            EscrowStatus::Funded
        );
        (funding.escrow_id, patient, doctor)
    }

    fn vote(decision: VoteDecision, split: Option<u8>) -> ArbitratorVote {
        ArbitratorVote {
            arbitrator_id: "arb".to_string(),
            decision,
            recommended_split: split,
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn test_witness_script_is_order_independent() {
        let secp = Secp256k1::new();
        let keys: Vec<PublicKey> = (1..=3u8)
            .map(|b| SecretKey::from_slice(&[b; 32]).unwrap().public_key(&secp))
            .collect();
        let a = multisig_witness_script([keys[0], keys[1], keys[2]]);
        let b = multisig_witness_script([keys[2], keys[0], keys[1]]);
        assert_eq!(a, b);
        // OP_2, three 33-byte pushes, OP_3, OP_CHECKMULTISIG
        assert_eq!(a.len(), 1 + 3 * 34 + 2);
    }

    #[test]
    fn test_decide_outcome_rules() {
        let policy = SettlementPolicy::default();
        assert_eq!(
            decide_outcome(&[vote(VoteDecision::Patient, None), vote(VoteDecision::Patient, None)], &policy),
            ResolutionOutcome::RefundToPatient { refund_percent: 90 }
        );
        assert_eq!(
            decide_outcome(&[vote(VoteDecision::Doctor, None), vote(VoteDecision::Doctor, None)], &policy),
            ResolutionOutcome::ReleaseToDoctor
        );
        assert_eq!(
            decide_outcome(&[vote(VoteDecision::Patient, None), vote(VoteDecision::Doctor, None)], &policy),
            ResolutionOutcome::RefundToPatient { refund_percent: 50 }
        );
        assert_eq!(
            decide_outcome(
                &[vote(VoteDecision::Split, Some(80)), vote(VoteDecision::Split, Some(61))],
                &policy
            ),
            ResolutionOutcome::RefundToPatient { refund_percent: 71 }
        );
        assert_eq!(
            decide_outcome(&[], &policy),
            ResolutionOutcome::RefundToPatient { refund_percent: 50 }
        );
    }

    #[test]
    fn test_plan_payout_conserves_value() {
        for (disposition, total_in) in [
            (Disposition::Release, 1_000_000),
            (Disposition::Release, 1_000_300),
            (Disposition::Refund { refund_percent: 100 }, 1_000_000),
            (Disposition::Refund { refund_percent: 50 }, 1_250_000),
            (Disposition::Refund { refund_percent: 0 }, 1_000_000),
        ] {
            let (payout, platform_output) =
                plan_payout(1_000_000, total_in, 1, disposition, 300, 3).unwrap();
            assert_eq!(payout.doctor_sats + payout.patient_sats + payout.platform_fee_sats, 1_000_000);
            assert_eq!(
                payout.doctor_sats
                    + payout.patient_sats
                    + payout.surplus_sats
                    + platform_output
                    + payout.network_fee_sats,
                total_in
            );
        }
        assert!(plan_payout(1_000_000, 999_999, 1, Disposition::Release, 300, 1).is_err());
    }

    #[test]
    fn test_plan_payout_rejects_fee_only_spend() {
        // 580 sats of fee without outputs fits, 735 + dust with a platform output does not
        assert!(matches!(
            plan_payout(1_000, 1_000, 1, Disposition::Refund { refund_percent: 0 }, 300, 5),
            Err(SettlementError::Validation(_))
        ));
        let (payout, platform_output) =
            plan_payout(1_000, 1_000, 1, Disposition::Refund { refund_percent: 0 }, 300, 1).unwrap();
        assert_eq!(payout.platform_fee_sats, 1_000);
        assert_eq!(platform_output, 1_000 - payout.network_fee_sats);
    }

    #[tokio::test]
    async fn test_release_to_doctor_scenario() {
        let h = Harness::new().await;
        let (escrow_id, _, doctor) = funded_escrow(&h).await;
        let mut events = h.events.subscribe();

        let outcome = h.multisig.release_to_doctor(escrow_id).await.unwrap();
        assert!(outcome.success);

        let escrow = h.multisig.get_escrow(escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert_eq!(escrow.release_txid, outcome.txid);
        let payout = escrow.payout.unwrap();
        assert_eq!(sats_to_btc(payout.doctor_sats), Decimal::from_str("0.0097").unwrap());
        assert_eq!(sats_to_btc(payout.platform_fee_sats), Decimal::from_str("0.0003").unwrap());
        assert_eq!(payout.doctor_sats + payout.platform_fee_sats, escrow.amount_sats);

        assert_eq!(h.chain.received_by(&doctor.address), 970_000);
        assert_eq!(
            h.chain.received_by(&key_address(0x31)),
            30_000 - payout.network_fee_sats
        );
        assert_eq!(events.recv().await.unwrap().event.name(), "escrow_released");
    }

    #[tokio::test]
    async fn test_manager_rejects_unusable_escrow_config() {
        let h = Harness::new().await;
        let build = |config: EscrowConfig, policy: SettlementPolicy| {
            MultisigEscrowManager::new(
                config,
                policy,
                h.wallets.clone(),
                h.chain.clone(),
                h.store.clone(),
                h.queue.clone(),
                h.events.clone(),
                Arc::new(h.clock.clone()),
            )
        };

        let mut no_fee_address = h.config.escrow.clone();
        no_fee_address.platform_fee_address = String::new();
        assert!(matches!(
            build(no_fee_address, h.config.policy.clone()),
            Err(SettlementError::Config(_))
        ));

        let mut no_arbitrators = h.config.escrow.clone();
        no_arbitrators.arbitrators.clear();
        assert!(matches!(
            build(no_arbitrators, h.config.policy.clone()),
            Err(SettlementError::Config(_))
        ));

        let mut unreachable_quorum = h.config.policy.clone();
        unreachable_quorum.required_votes = 4;
        assert!(matches!(
            build(h.config.escrow.clone(), unreachable_quorum),
            Err(SettlementError::Config(_))
        ));

        assert!(build(h.config.escrow.clone(), h.config.policy.clone()).is_ok());
    }

    #[tokio::test]
    async fn test_release_requires_funding() {
        let h = Harness::new().await;
        let patient = h.wallets.create_wallet("p", None).await.unwrap();
        let doctor = h.wallets.create_wallet("d", None).await.unwrap();
        let funding = h
            .multisig
            .create_escrow("c", &patient.address, &doctor.address, Decimal::from_str("0.001").unwrap(), None)
            .await
            .unwrap();

        let result = h.multisig.release_to_doctor(funding.escrow_id).await;
        assert!(matches!(result, Err(SettlementError::StateTransition { .. })));
        assert_eq!(h.chain.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_unfunded_escrow_expires() {
        let h = Harness::new().await;
        let patient = h.wallets.create_wallet("p", None).await.unwrap();
        let doctor = h.wallets.create_wallet("d", None).await.unwrap();
        let funding = h
            .multisig
            .create_escrow("c", &patient.address, &doctor.address, Decimal::from_str("0.001").unwrap(), Some(2))
            .await
            .unwrap();

        // Unconfirmed funds do not count
        h.chain.fund_unconfirmed(&funding.address, funding.amount_sats);
        assert_eq!(h.multisig.monitor_all().await.unwrap(), 0);

        h.clock.advance(Duration::hours(3));
        assert_eq!(h.multisig.monitor_all().await.unwrap(), 1);
        let escrow = h.multisig.get_escrow(funding.escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Expired);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_monitors_fund_once() {
        let h = Harness::new().await;
        let patient = h.wallets.create_wallet("p", None).await.unwrap();
        let doctor = h.wallets.create_wallet("d", None).await.unwrap();
        let funding = h
            .multisig
            .create_escrow("c", &patient.address, &doctor.address, Decimal::from_str("0.002").unwrap(), None)
            .await
            .unwrap();
        h.chain.fund(&funding.address, funding.amount_sats);
        let mut events = h.events.subscribe();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let multisig = h.multisig.clone();
                let escrow_id = funding.escrow_id;
                tokio::spawn(async move { multisig.monitor_funding(escrow_id).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), EscrowStatus::Funded);
        }

        let mut funded_events = 0;
        while let Ok(envelope) = events.try_recv() {
            if envelope.event.name() == "escrow_funded" {
                funded_events += 1;
            }
        }
        assert_eq!(funded_events, 1);
    }

    #[tokio::test]
    async fn test_failed_broadcast_reverts_claim() {
        let h = Harness::new().await;
        let (escrow_id, _, _) = funded_escrow(&h).await;

        h.chain.reject_next_broadcasts(1);
        let result = h.multisig.release_to_doctor(escrow_id).await;
        assert!(matches!(result, Err(SettlementError::BroadcastRejected(_))));
        let escrow = h.multisig.get_escrow(escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Funded);

        h.multisig.release_to_doctor(escrow_id).await.unwrap();
        assert!(matches!(
            h.multisig.release_to_doctor(escrow_id).await,
            Err(SettlementError::StateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispute_validation() {
        let h = Harness::new().await;
        let (escrow_id, patient, _) = funded_escrow(&h).await;
        h.clock.advance(Duration::hours(5));

        assert!(matches!(
            h.multisig.initiate_dispute(escrow_id, "stranger", "no show").await,
            Err(SettlementError::Dispute(_))
        ));
        let dispute = h
            .multisig
            .initiate_dispute(escrow_id, &patient.user_id, "no show")
            .await
            .unwrap();
        assert_eq!(dispute.created_at, h.clock.now());
        assert_eq!(dispute.deadline, h.clock.now() + Duration::hours(72));
        assert!(matches!(
            h.multisig.initiate_dispute(escrow_id, &patient.user_id, "again").await,
            Err(SettlementError::StateTransition { .. })
        ));

        assert!(matches!(
            h.multisig
                .submit_arbitrator_vote(dispute.id, "arb-9", VoteDecision::Patient, None)
                .await,
            Err(SettlementError::Dispute(_))
        ));
        assert!(matches!(
            h.multisig
                .submit_arbitrator_vote(dispute.id, "arb-1", VoteDecision::Split, None)
                .await,
            Err(SettlementError::Validation(_))
        ));
        h.multisig
            .submit_arbitrator_vote(dispute.id, "arb-1", VoteDecision::Patient, None)
            .await
            .unwrap();
        assert!(matches!(
            h.multisig
                .submit_arbitrator_vote(dispute.id, "arb-1", VoteDecision::Doctor, None)
                .await,
            Err(SettlementError::Dispute(_))
        ));
    }

    #[tokio::test]
    async fn test_tie_vote_refunds_half() {
        let h = Harness::new().await;
        let (escrow_id, patient, _) = funded_escrow(&h).await;
        let dispute = h
            .multisig
            .initiate_dispute(escrow_id, &patient.address, "consultation cut short")
            .await
            .unwrap();

        let after_one = h
            .multisig
            .submit_arbitrator_vote(dispute.id, "arb-1", VoteDecision::Patient, None)
            .await
            .unwrap();
        assert!(!after_one.is_resolved());
        assert_eq!(h.multisig.sweep_disputes().await.unwrap(), 0);
        assert!(h.multisig.resolve_dispute(dispute.id).await.is_err());

        let resolved = h
            .multisig
            .submit_arbitrator_vote(dispute.id, "arb-2", VoteDecision::Doctor, None)
            .await
            .unwrap();
        let resolution = resolved.resolution.unwrap();
        assert_eq!(resolution.outcome, ResolutionOutcome::RefundToPatient { refund_percent: 50 });
        assert_eq!(resolution.resolved_by, ResolvedBy::Votes);
        assert_eq!(resolution.arbitrator_fee_sats, 10_000);

        let escrow = h.multisig.get_escrow(escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Resolved);
        let payout = escrow.payout.unwrap();
        assert_eq!(payout.patient_sats, 500_000);
        assert_eq!(payout.patient_sats + payout.platform_fee_sats, escrow.amount_sats);
        assert_eq!(h.chain.received_by(&patient.address), 500_000);

        let fees: Vec<_> = h
            .store
            .queue_items()
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.item_type == QueueItemType::ArbitratorFee)
            .collect();
        assert_eq!(fees.len(), 2);
        assert!(fees.iter().all(|i| i.amount_sats == 5_000 && i.status == QueueItemStatus::Queued));
        assert_eq!(fees[0].recipient, key_address(0x21));
    }

    #[tokio::test]
    async fn test_timeout_sweep_splits_evenly() {
        let h = Harness::new().await;
        let (escrow_id, patient, doctor) = funded_escrow(&h).await;
        let dispute = h
            .multisig
            .initiate_dispute(escrow_id, &doctor.user_id, "patient unreachable")
            .await
            .unwrap();

        h.clock.advance(Duration::hours(71));
        assert_eq!(h.multisig.sweep_disputes().await.unwrap(), 0);
        h.clock.advance(Duration::hours(2));
        assert_eq!(h.multisig.sweep_disputes().await.unwrap(), 1);
        assert_eq!(h.multisig.sweep_disputes().await.unwrap(), 0);

        let dispute = h.multisig.get_dispute(dispute.id).await.unwrap().unwrap();
        let resolution = dispute.resolution.unwrap();
        assert_eq!(resolution.resolved_by, ResolvedBy::Timeout);
        assert_eq!(resolution.outcome, ResolutionOutcome::RefundToPatient { refund_percent: 50 });
        assert_eq!(resolution.arbitrator_fee_sats, 0);
        assert_eq!(h.chain.received_by(&patient.address), 500_000);
        assert!(h.store.queue_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_direct_release_closes_dispute() {
        let h = Harness::new().await;
        let (escrow_id, patient, _) = funded_escrow(&h).await;
        let dispute = h
            .multisig
            .initiate_dispute(escrow_id, &patient.user_id, "late")
            .await
            .unwrap();

        h.multisig.release_to_doctor(escrow_id).await.unwrap();
        let dispute = h.multisig.dispute_for_escrow(escrow_id).await.unwrap().unwrap();
        assert_eq!(dispute.resolution.unwrap().resolved_by, ResolvedBy::Manual);
        assert!(h.multisig.resolve_dispute(dispute.id).await.unwrap().is_none());
    }
}
