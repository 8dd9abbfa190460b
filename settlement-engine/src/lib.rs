//! Bitcoin settlement backend for paid consultations
//!
//! This crate moves consultation payments between patients, doctors and the
//! platform using:
//! - Per-user BIP84 wallets with sealed key material
//! - 2-of-3 P2WSH multisig escrows with arbitrated disputes
//! - Lightning (LDK) first, on-chain fallback for direct payments
//! - A durable payout queue with bounded retry

pub mod amount;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod fees;
pub mod keystore;
pub mod lightning;
pub mod models;
pub mod multisig;
pub mod network;
pub mod node;
pub mod processor;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;

pub use error::SettlementError;
pub use node::{NodeBackends, NodeHealth, SettlementNode};

/// Result type alias for settlement operations
pub type SettlementResult<T> = Result<T, SettlementError>;
