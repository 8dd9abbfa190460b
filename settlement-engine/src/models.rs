//! Core data models for the settlement engine
//!
//! Wallets, escrows (multisig and lightweight), disputes and payout queue
//! items, together with the status machines that gate their transitions.

use bitcoin::{Network, ScriptBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{keystore::EncryptedSecret, SettlementError, SettlementResult};

/// Confirmed / unconfirmed balance pair in satoshis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed_sats: u64,
    pub unconfirmed_sats: u64,
}

impl Balance {
    pub fn total_sats(&self) -> u64 {
        self.confirmed_sats + self.unconfirmed_sats
    }
}

/// Result of a balance sync; `stale` is set when the indexer was unreachable
/// and the cached value was returned instead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub address: String,
    pub balance: Balance,
    pub stale: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

/// What kind of secret a wallet holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretKind {
    /// BIP39 phrase, keys derived along the BIP84 path
    Mnemonic,
    /// Imported WIF private key
    PrivateKey,
}

/// Per-user wallet record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub network: Network,
    pub btc_address: String,
    pub public_key: Option<String>,
    pub secret_kind: Option<SecretKind>,
    pub encrypted_secret: Option<EncryptedSecret>,
    pub derivation_index: u32,
    pub balance: Balance,
    pub balance_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Watch-only wallets were imported without a private key
    pub fn is_watch_only(&self) -> bool {
        self.encrypted_secret.is_none()
    }

    /// Public view, never includes key material
    pub fn info(&self) -> WalletInfo {
        WalletInfo {
            user_id: self.user_id.clone(),
            address: self.btc_address.clone(),
            public_key: self.public_key.clone(),
            network: self.network,
            balance: self.balance,
            watch_only: self.is_watch_only(),
        }
    }
}

/// Wallet summary returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub user_id: String,
    pub address: String,
    pub public_key: Option<String>,
    pub network: Network,
    pub balance: Balance,
    pub watch_only: bool,
}

/// Unspent output as reported by the indexer. Never cached across a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
}

/// Payment destination for transaction construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub amount_sats: u64,
}

impl Recipient {
    pub fn new<S: Into<String>>(address: S, amount_sats: u64) -> Self {
        Self {
            address: address.into(),
            amount_sats,
        }
    }
}

/// Signed but not yet broadcast transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub txid: String,
    pub tx_hex: String,
    pub fee_sats: u64,
    pub input_count: usize,
    pub change_sats: Option<u64>,
    pub vsize: usize,
}

/// Multisig escrow state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Address generated, awaiting funding
    Created,
    /// Required amount confirmed at the escrow address
    Funded,
    /// Release or refund transaction being built and broadcast
    Settling,
    /// Funds paid to the doctor
    Released,
    /// Funds (partially) returned to the patient
    Refunded,
    /// Under arbitration
    Disputed,
    /// Dispute decided and paid out
    Resolved,
    /// Never funded before the deadline
    Expired,
}

impl EscrowStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Resolved | Self::Expired)
    }

    /// Release/refund need funds in place
    pub fn can_settle(&self) -> bool {
        matches!(self, Self::Funded | Self::Disputed)
    }

    /// Disputes are only opened against funded escrows
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Funded)
    }
}

/// One side of a multisig escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowParty {
    pub address: String,
    pub public_key: String,
}

/// 2-of-3 multisig escrow for one consultation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultisigEscrow {
    pub id: Uuid,
    pub consultation_id: String,
    pub patient: EscrowParty,
    pub doctor: EscrowParty,
    pub arbitrator_id: String,
    pub arbitrator_public_key: String,
    pub amount_sats: u64,
    pub address: String,
    pub witness_script: String,
    pub status: EscrowStatus,

    pub funding_txid: Option<String>,
    pub release_txid: Option<String>,
    pub refund_txid: Option<String>,
    pub payout: Option<Payout>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl MultisigEscrow {
    /// Validate a state transition
    pub fn validate_transition(&self, to_state: EscrowStatus) -> SettlementResult<()> {
        let valid = match (&self.status, &to_state) {
            (EscrowStatus::Created, EscrowStatus::Funded) => true,
            (EscrowStatus::Created, EscrowStatus::Expired) => true,
            (EscrowStatus::Funded, EscrowStatus::Settling) => true,
            (EscrowStatus::Funded, EscrowStatus::Disputed) => true,
            (EscrowStatus::Disputed, EscrowStatus::Settling) => true,
            (EscrowStatus::Settling, EscrowStatus::Released) => true,
            (EscrowStatus::Settling, EscrowStatus::Refunded) => true,
            (EscrowStatus::Settling, EscrowStatus::Resolved) => true,
            // Failed broadcast hands the escrow back
            (EscrowStatus::Settling, EscrowStatus::Funded) => true,
            (EscrowStatus::Settling, EscrowStatus::Disputed) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(SettlementError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to_state),
                "Invalid escrow transition".to_string(),
            ))
        }
    }
}

/// How escrowed funds were split on settlement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub doctor_sats: u64,
    pub patient_sats: u64,
    /// Share of the escrow amount kept by the platform (network fee included)
    pub platform_fee_sats: u64,
    pub network_fee_sats: u64,
    /// Overfunding returned to the patient on top of `patient_sats`
    pub surplus_sats: u64,
}

/// Arbitrator ballot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Patient,
    Doctor,
    Split,
}

/// A single arbitrator vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitratorVote {
    pub arbitrator_id: String,
    pub decision: VoteDecision,
    /// Percent refunded to the patient, split votes only
    pub recommended_split: Option<u8>,
    pub cast_at: DateTime<Utc>,
}

/// Who decided a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    Votes,
    Timeout,
    /// Parties settled directly with the arbitrator while the dispute was open
    Manual,
}

/// Disposition of disputed funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Release path, doctor paid net of platform fee
    ReleaseToDoctor,
    /// Refund path, `refund_percent` of the amount to the patient
    RefundToPatient { refund_percent: u8 },
}

/// Final dispute decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub outcome: ResolutionOutcome,
    pub resolved_by: ResolvedBy,
    pub txid: Option<String>,
    pub arbitrator_fee_sats: u64,
    pub resolved_at: DateTime<Utc>,
}

/// Dispute against a funded multisig escrow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub initiator: String,
    pub reason: String,
    pub deadline: DateTime<Utc>,
    pub votes: Vec<ArbitratorVote>,
    /// Set once a resolver claimed the dispute; guards double execution
    pub resolving: bool,
    pub resolution: Option<DisputeResolution>,
    pub created_at: DateTime<Utc>,
}

impl Dispute {
    pub fn new(
        escrow_id: Uuid,
        initiator: String,
        reason: String,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            initiator,
            reason,
            deadline,
            votes: Vec::new(),
            resolving: false,
            resolution: None,
            created_at,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn has_voted(&self, arbitrator_id: &str) -> bool {
        self.votes.iter().any(|v| v.arbitrator_id == arbitrator_id)
    }
}

/// Lightweight (custodial, non-multisig) escrow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationEscrowStatus {
    Pending,
    Processing,
    Completed,
    Releasing,
    Released,
    Refunding,
    Refunded,
    Disputed,
    Resolving,
    Resolved,
    Failed,
    Expired,
}

impl ConsultationEscrowStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Released
                | Self::Refunded
                | Self::Resolved
                | Self::Failed
                | Self::Expired
        )
    }

    /// A payment or payout is in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Processing | Self::Releasing | Self::Refunding | Self::Resolving)
    }
}

/// Rail a payment settled over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Lightning,
    Onchain,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lightning => write!(f, "lightning"),
            Self::Onchain => write!(f, "onchain"),
        }
    }
}

/// Custodial escrow used by the direct payment path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationEscrow {
    pub id: Uuid,
    pub consultation_id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub amount_sats: u64,
    pub is_urgent: bool,
    pub status: ConsultationEscrowStatus,
    pub payment_method: Option<PaymentMethod>,
    pub platform_fee_sats: u64,
    pub doctor_amount_sats: u64,
    pub txid: Option<String>,
    pub payment_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Kind of queued payout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemType {
    ConsultationPayment,
    PlatformFee,
    DailyReward,
    ArbitratorFee,
}

/// Queue item lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Queued,
    Processing,
    Completed,
    Retrying,
    Failed,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Durable payout queue entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentQueueItem {
    pub id: Uuid,
    /// Enqueue order; FIFO among eligible items
    pub sequence: u64,
    pub item_type: QueueItemType,
    pub recipient: String,
    pub amount_sats: u64,
    /// Escrow or consultation the payout belongs to
    pub reference: Option<String>,
    pub status: QueueItemStatus,
    pub retry_count: u32,
    pub not_before: DateTime<Utc>,
    pub last_error: Option<String>,
    pub txid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-facing result of any payment operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub success: bool,
    pub txid: Option<String>,
    pub payment_hash: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub fee_sats: u64,
    pub error: Option<String>,
}

impl PaymentOutcome {
    pub fn onchain(txid: String, fee_sats: u64) -> Self {
        Self {
            success: true,
            txid: Some(txid),
            payment_method: Some(PaymentMethod::Onchain),
            fee_sats,
            ..Default::default()
        }
    }

    pub fn lightning(payment_hash: String, fee_sats: u64) -> Self {
        Self {
            success: true,
            payment_hash: Some(payment_hash),
            payment_method: Some(PaymentMethod::Lightning),
            fee_sats,
            ..Default::default()
        }
    }

    pub fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
