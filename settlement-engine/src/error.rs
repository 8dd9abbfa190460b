//! Error types for the settlement engine
//!
//! One error enum covers wallet, escrow, dispute and payment failures so
//! callers can match on the category (validation, funds, network, broadcast,
//! state) without caring which component raised it.

use thiserror::Error;

/// Main error type for settlement operations
#[derive(Error, Debug)]
pub enum SettlementError {
    /// Malformed address, amount or request field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Spendable inputs do not cover outputs plus fee
    #[error("Insufficient funds: need {needed_sats} sats, have {available_sats} sats")]
    InsufficientFunds {
        needed_sats: u64,
        available_sats: u64,
    },

    /// Indexer, broadcaster or Lightning node unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// Transaction rejected by the network (double-spend, low fee, malformed)
    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Dispute arbitration errors (duplicate vote, unknown arbitrator, ...)
    #[error("Dispute error: {0}")]
    Dispute(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Supplied private key does not control the supplied address
    #[error("Key mismatch: {0}")]
    KeyMismatch(String),

    /// Key derivation, encryption or signing errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Unknown wallet, escrow, dispute or queue item
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// UUID parsing errors
    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an insufficient funds error
    pub fn insufficient_funds(needed_sats: u64, available_sats: u64) -> Self {
        Self::InsufficientFunds {
            needed_sats,
            available_sats,
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create a broadcast rejection error
    pub fn broadcast_rejected<S: Into<String>>(msg: S) -> Self {
        Self::BroadcastRejected(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create a dispute error
    pub fn dispute<S: Into<String>>(msg: S) -> Self {
        Self::Dispute(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a key mismatch error
    pub fn key_mismatch<S: Into<String>>(msg: S) -> Self {
        Self::KeyMismatch(msg.into())
    }

    /// Create a cryptographic error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure is transient and worth retrying or falling back on
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::BroadcastRejected(_) | Self::InsufficientFunds { .. }
        )
    }
}

impl From<reqwest::Error> for SettlementError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<config::ConfigError> for SettlementError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<bitcoin::address::ParseError> for SettlementError {
    fn from(err: bitcoin::address::ParseError) -> Self {
        Self::Validation(format!("invalid address: {}", err))
    }
}

impl From<bitcoin::bip32::Error> for SettlementError {
    fn from(err: bitcoin::bip32::Error) -> Self {
        Self::Crypto(format!("key derivation failed: {}", err))
    }
}

impl From<secp256k1::Error> for SettlementError {
    fn from(err: secp256k1::Error) -> Self {
        Self::Crypto(err.to_string())
    }
}
