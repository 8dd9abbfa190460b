//! Outbound settlement events
//!
//! Consumers (the consultation workflow, notifiers, audit logging) subscribe
//! to a broadcast channel instead of being called back by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{PaymentMethod, QueueItemType, ResolutionOutcome};

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    EscrowFunded {
        escrow_id: Uuid,
        consultation_id: String,
        amount_sats: u64,
        txid: Option<String>,
    },
    EscrowReleased {
        escrow_id: Uuid,
        txid: String,
        doctor_sats: u64,
        platform_fee_sats: u64,
    },
    EscrowRefunded {
        escrow_id: Uuid,
        txid: String,
        patient_sats: u64,
        platform_fee_sats: u64,
    },
    EscrowExpired {
        escrow_id: Uuid,
    },
    DisputeInitiated {
        dispute_id: Uuid,
        escrow_id: Uuid,
        initiator: String,
    },
    DisputeResolved {
        dispute_id: Uuid,
        escrow_id: Uuid,
        outcome: ResolutionOutcome,
    },
    PaymentCompleted {
        escrow_id: Uuid,
        method: PaymentMethod,
        reference: String,
    },
    PaymentFailed {
        reference: String,
        item_type: Option<QueueItemType>,
        error: String,
    },
    BalanceStale {
        address: String,
    },
}

impl SettlementEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::EscrowFunded { .. } => "escrow_funded",
            Self::EscrowReleased { .. } => "escrow_released",
            Self::EscrowRefunded { .. } => "escrow_refunded",
            Self::EscrowExpired { .. } => "escrow_expired",
            Self::DisputeInitiated { .. } => "dispute_initiated",
            Self::DisputeResolved { .. } => "dispute_resolved",
            Self::PaymentCompleted { .. } => "payment_completed",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::BalanceStale { .. } => "balance_stale",
        }
    }
}

/// Event with emission time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: SettlementEvent,
    pub emitted_at: DateTime<Utc>,
}

/// Fan-out channel for [`SettlementEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Publish; having no subscribers is not an error
    pub fn emit(&self, event: SettlementEvent) {
        debug!("Emitting {}", event.name());
        let _ = self.sender.send(EventEnvelope {
            event,
            emitted_at: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
