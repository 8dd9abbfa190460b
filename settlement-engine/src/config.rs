//! Engine configuration
//!
//! Each component owns a config struct with sensible defaults; they are
//! aggregated in [`SettlementConfig`], which can be loaded from a TOML file
//! and `SETTLEMENT__*` environment variables through the `config` crate.

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::{SettlementError, SettlementResult};

/// Business policy values. None of these are structural; all are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementPolicy {
    /// Platform fee on release, in basis points
    pub platform_fee_bps: u32,
    /// Arbitrator fee paid out of a resolved dispute, in basis points
    pub arbitrator_fee_bps: u32,
    /// Refund share when the arbitrators side with the patient
    pub patient_win_refund_percent: u8,
    /// Refund share on a tied vote with no split recommendations
    pub tie_refund_percent: u8,
    /// Refund share when a dispute times out with no votes
    pub timeout_refund_percent: u8,
    /// Hours arbitrators have before the timeout sweep decides
    pub dispute_window_hours: i64,
    /// Lightweight escrow expiry for urgent consultations
    pub urgent_window_hours: i64,
    /// Lightweight escrow expiry for normal consultations
    pub normal_window_hours: i64,
    /// Votes needed to resolve a dispute before its deadline
    pub required_votes: usize,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            platform_fee_bps: 300,
            arbitrator_fee_bps: 100,
            patient_win_refund_percent: 90,
            tie_refund_percent: 50,
            timeout_refund_percent: 50,
            dispute_window_hours: 72,
            urgent_window_hours: 2,
            normal_window_hours: 24,
            required_votes: 2,
        }
    }
}

/// Wallet manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Secret the per-user vault keys are derived from
    pub vault_master_secret: String,
    /// Argon2id memory cost in KiB
    pub kdf_memory_kib: u32,
    /// Argon2id iterations
    pub kdf_iterations: u32,
    /// Confirmation target (blocks) used when asking the fee oracle
    pub fee_target_blocks: u16,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            vault_master_secret: String::new(),
            kdf_memory_kib: 19_456,
            kdf_iterations: 2,
            fee_target_blocks: 6,
        }
    }
}

/// A preconfigured arbitrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitratorConfig {
    pub id: String,
    /// Hex-encoded secp256k1 secret key
    pub secret_key: String,
    /// Where the arbitrator's share of dispute fees is paid
    pub payout_address: String,
}

/// Multisig escrow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    pub arbitrators: Vec<ArbitratorConfig>,
    /// Platform fee sweep destination
    pub platform_fee_address: String,
    /// Default funding window when the caller does not give one
    pub default_timeout_hours: i64,
    /// Largest escrow accepted, in sats
    pub max_escrow_sats: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            arbitrators: Vec::new(),
            platform_fee_address: String::new(),
            default_timeout_hours: 48,
            max_escrow_sats: 100_000_000, // 1 BTC
        }
    }
}

impl EscrowConfig {
    /// Arbitrators must be able to reach the vote threshold and fees need a destination
    pub fn validate(&self, policy: &SettlementPolicy) -> SettlementResult<()> {
        if self.arbitrators.is_empty() {
            return Err(SettlementError::config("escrow.arbitrators must not be empty"));
        }
        if policy.required_votes > self.arbitrators.len() {
            return Err(SettlementError::config(format!(
                "policy.required_votes ({}) exceeds the {} configured arbitrators",
                policy.required_votes,
                self.arbitrators.len()
            )));
        }
        if self.platform_fee_address.trim().is_empty() {
            return Err(SettlementError::config("escrow.platform_fee_address must be set"));
        }
        Ok(())
    }
}

/// Payment processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Wallet that holds custodial consultation funds
    pub treasury_user_id: String,
    /// Platform fee sweep destination
    pub platform_fee_address: String,
    /// Try Lightning before on-chain
    pub enable_lightning: bool,
    /// Per-call Lightning payment timeout
    pub lightning_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            treasury_user_id: "treasury".to_string(),
            platform_fee_address: String::new(),
            enable_lightning: true,
            lightning_timeout_secs: 30,
        }
    }
}

/// Payout queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts before an item is marked failed
    pub max_attempts: u32,
    /// Linear backoff step; attempt N waits N * step
    pub backoff_step_secs: i64,
    /// Items processed per drain
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_secs: 60,
            batch_size: 10,
        }
    }
}

/// Background job intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub funding_monitor_secs: u64,
    pub dispute_sweep_secs: u64,
    pub queue_drain_secs: u64,
    pub escrow_expiry_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            funding_monitor_secs: 60,
            dispute_sweep_secs: 60,
            queue_drain_secs: 5,
            escrow_expiry_secs: 60,
        }
    }
}

/// Esplora indexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub esplora_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            esplora_url: "https://blockstream.info/testnet/api".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub network: Network,
    pub policy: SettlementPolicy,
    pub wallet: WalletConfig,
    pub escrow: EscrowConfig,
    pub processor: ProcessorConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub chain: ChainConfig,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            policy: SettlementPolicy::default(),
            wallet: WalletConfig::default(),
            escrow: EscrowConfig::default(),
            processor: ProcessorConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            chain: ChainConfig::default(),
        }
    }
}

impl SettlementConfig {
    /// Load from an optional file plus `SETTLEMENT__SECTION__KEY` env vars
    pub fn load(path: Option<&str>) -> SettlementResult<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Same sources as [`SettlementConfig::load`] without validation
    pub fn read(path: Option<&str>) -> SettlementResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("SETTLEMENT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> SettlementResult<()> {
        let policy = &self.policy;
        if policy.platform_fee_bps >= 10_000 || policy.arbitrator_fee_bps >= 10_000 {
            return Err(SettlementError::config("fee basis points must be below 10000"));
        }
        for percent in [
            policy.patient_win_refund_percent,
            policy.tie_refund_percent,
            policy.timeout_refund_percent,
        ] {
            if percent > 100 {
                return Err(SettlementError::config("refund percent must be within 0..=100"));
            }
        }
        if policy.required_votes == 0 {
            return Err(SettlementError::config("required_votes must be at least 1"));
        }
        self.escrow.validate(policy)?;
        if self.queue.max_attempts == 0 {
            return Err(SettlementError::config("queue.max_attempts must be at least 1"));
        }
        if self.wallet.vault_master_secret.len() < 16 {
            return Err(SettlementError::config(
                "wallet.vault_master_secret must be at least 16 characters",
            ));
        }
        Ok(())
    }
}
