//! Persistence seams
//!
//! Components depend on these traits, not on storage. Every status-changing
//! write goes through a compare-and-set (`*_if`) method that re-checks the
//! current status under the store's own lock, which is what makes escrow and
//! queue transitions single-shot under concurrent monitors and sweeps.
//!
//! [`InMemoryStore`] implements all three traits; a database-backed store
//! only needs to honour the same compare-and-set contract.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    models::{
        Balance, ConsultationEscrow, ConsultationEscrowStatus, Dispute, EscrowStatus, MultisigEscrow,
        PaymentQueueItem, QueueItemStatus, Wallet,
    },
    SettlementError, SettlementResult,
};

pub type EscrowUpdate = Box<dyn FnOnce(&mut MultisigEscrow) + Send>;
pub type DisputeUpdate = Box<dyn FnOnce(&mut Dispute) -> SettlementResult<()> + Send>;
pub type ConsultationEscrowUpdate = Box<dyn FnOnce(&mut ConsultationEscrow) + Send>;
pub type QueueItemUpdate = Box<dyn FnOnce(&mut PaymentQueueItem) + Send>;

/// Wallet records and the address -> user index
#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Insert a new wallet; fails if the user already has one
    async fn insert_wallet(&self, wallet: Wallet) -> SettlementResult<()>;

    async fn get_wallet(&self, user_id: &str) -> SettlementResult<Option<Wallet>>;

    async fn wallet_by_address(&self, address: &str) -> SettlementResult<Option<Wallet>>;

    async fn update_balance(
        &self,
        user_id: &str,
        balance: Balance,
        synced_at: DateTime<Utc>,
    ) -> SettlementResult<()>;
}

/// Multisig escrows and their disputes
#[async_trait]
pub trait EscrowRepository: Send + Sync {
    async fn insert_escrow(&self, escrow: MultisigEscrow) -> SettlementResult<()>;

    async fn get_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<MultisigEscrow>>;

    async fn escrows_with_status(&self, status: EscrowStatus) -> SettlementResult<Vec<MultisigEscrow>>;

    /// Apply `update` only if the escrow is currently in one of `expected`.
    /// Returns the updated escrow, or `None` if the status did not match.
    async fn update_escrow_if(
        &self,
        escrow_id: Uuid,
        expected: &[EscrowStatus],
        update: EscrowUpdate,
    ) -> SettlementResult<Option<MultisigEscrow>>;

    async fn insert_dispute(&self, dispute: Dispute) -> SettlementResult<()>;

    async fn get_dispute(&self, dispute_id: Uuid) -> SettlementResult<Option<Dispute>>;

    async fn dispute_for_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<Dispute>>;

    /// Disputes with no resolution yet
    async fn open_disputes(&self) -> SettlementResult<Vec<Dispute>>;

    /// Atomically mutate a dispute; an error from `update` leaves it untouched
    async fn update_dispute(&self, dispute_id: Uuid, update: DisputeUpdate) -> SettlementResult<Dispute>;
}

/// Lightweight escrows and the payout queue
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert_consultation_escrow(&self, escrow: ConsultationEscrow) -> SettlementResult<()>;

    async fn get_consultation_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<ConsultationEscrow>>;

    async fn consultation_escrows_with_status(
        &self,
        status: ConsultationEscrowStatus,
    ) -> SettlementResult<Vec<ConsultationEscrow>>;

    async fn update_consultation_escrow_if(
        &self,
        escrow_id: Uuid,
        expected: &[ConsultationEscrowStatus],
        update: ConsultationEscrowUpdate,
    ) -> SettlementResult<Option<ConsultationEscrow>>;

    /// Insert a queue item, assigning its FIFO sequence number
    async fn insert_queue_item(&self, item: PaymentQueueItem) -> SettlementResult<PaymentQueueItem>;

    async fn get_queue_item(&self, item_id: Uuid) -> SettlementResult<Option<PaymentQueueItem>>;

    /// Queued or retrying items whose backoff has elapsed, oldest first
    async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> SettlementResult<Vec<PaymentQueueItem>>;

    async fn queue_items(&self) -> SettlementResult<Vec<PaymentQueueItem>>;

    async fn update_queue_item_if(
        &self,
        item_id: Uuid,
        expected: &[QueueItemStatus],
        update: QueueItemUpdate,
    ) -> SettlementResult<Option<PaymentQueueItem>>;
}

/// In-memory storage for all engine state
#[derive(Default)]
pub struct InMemoryStore {
    wallets: Arc<RwLock<HashMap<String, Wallet>>>,
    address_index: Arc<RwLock<HashMap<String, String>>>,
    escrows: Arc<RwLock<HashMap<Uuid, MultisigEscrow>>>,
    disputes: Arc<RwLock<HashMap<Uuid, Dispute>>>,
    consultation_escrows: Arc<RwLock<HashMap<Uuid, ConsultationEscrow>>>,
    queue: Arc<RwLock<HashMap<Uuid, PaymentQueueItem>>>,
    queue_sequence: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRepository for InMemoryStore {
    async fn insert_wallet(&self, wallet: Wallet) -> SettlementResult<()> {
        let mut wallets = self.wallets.write().await;
        if wallets.contains_key(&wallet.user_id) {
            return Err(SettlementError::validation(format!(
                "User {} already has a wallet",
                wallet.user_id
            )));
        }
        let mut index = self.address_index.write().await;
        if let Some(owner) = index.get(&wallet.btc_address) {
            return Err(SettlementError::validation(format!(
                "Address {} already registered to {}",
                wallet.btc_address, owner
            )));
        }
        index.insert(wallet.btc_address.clone(), wallet.user_id.clone());
        wallets.insert(wallet.user_id.clone(), wallet);
        Ok(())
    }

    async fn get_wallet(&self, user_id: &str) -> SettlementResult<Option<Wallet>> {
        Ok(self.wallets.read().await.get(user_id).cloned())
    }

    async fn wallet_by_address(&self, address: &str) -> SettlementResult<Option<Wallet>> {
        let user_id = match self.address_index.read().await.get(address) {
            Some(user_id) => user_id.clone(),
            None => return Ok(None),
        };
        self.get_wallet(&user_id).await
    }

    async fn update_balance(
        &self,
        user_id: &str,
        balance: Balance,
        synced_at: DateTime<Utc>,
    ) -> SettlementResult<()> {
        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .get_mut(user_id)
            .ok_or_else(|| SettlementError::not_found(format!("Wallet for {} not found", user_id)))?;
        wallet.balance = balance;
        wallet.balance_synced_at = Some(synced_at);
        wallet.updated_at = synced_at;
        Ok(())
    }
}

#[async_trait]
impl EscrowRepository for InMemoryStore {
    async fn insert_escrow(&self, escrow: MultisigEscrow) -> SettlementResult<()> {
        self.escrows.write().await.insert(escrow.id, escrow);
        Ok(())
    }

    async fn get_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<MultisigEscrow>> {
        Ok(self.escrows.read().await.get(&escrow_id).cloned())
    }

    async fn escrows_with_status(&self, status: EscrowStatus) -> SettlementResult<Vec<MultisigEscrow>> {
        Ok(self
            .escrows
            .read()
            .await
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn update_escrow_if(
        &self,
        escrow_id: Uuid,
        expected: &[EscrowStatus],
        update: EscrowUpdate,
    ) -> SettlementResult<Option<MultisigEscrow>> {
        let mut escrows = self.escrows.write().await;
        let escrow = escrows
            .get_mut(&escrow_id)
            .ok_or_else(|| SettlementError::not_found(format!("Escrow {} not found", escrow_id)))?;
        if !expected.contains(&escrow.status) {
            return Ok(None);
        }
        update(escrow);
        Ok(Some(escrow.clone()))
    }

    async fn insert_dispute(&self, dispute: Dispute) -> SettlementResult<()> {
        let mut disputes = self.disputes.write().await;
        if disputes.values().any(|d| d.escrow_id == dispute.escrow_id) {
            return Err(SettlementError::dispute(format!(
                "Escrow {} already has a dispute",
                dispute.escrow_id
            )));
        }
        disputes.insert(dispute.id, dispute);
        Ok(())
    }

    async fn get_dispute(&self, dispute_id: Uuid) -> SettlementResult<Option<Dispute>> {
        Ok(self.disputes.read().await.get(&dispute_id).cloned())
    }

    async fn dispute_for_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<Dispute>> {
        Ok(self
            .disputes
            .read()
            .await
            .values()
            .find(|d| d.escrow_id == escrow_id)
            .cloned())
    }

    async fn open_disputes(&self) -> SettlementResult<Vec<Dispute>> {
        Ok(self
            .disputes
            .read()
            .await
            .values()
            .filter(|d| !d.is_resolved())
            .cloned()
            .collect())
    }

    async fn update_dispute(&self, dispute_id: Uuid, update: DisputeUpdate) -> SettlementResult<Dispute> {
        let mut disputes = self.disputes.write().await;
        let dispute = disputes
            .get_mut(&dispute_id)
            .ok_or_else(|| SettlementError::not_found(format!("Dispute {} not found", dispute_id)))?;

        let mut draft = dispute.clone();
        update(&mut draft)?;
        *dispute = draft;
        Ok(dispute.clone())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn insert_consultation_escrow(&self, escrow: ConsultationEscrow) -> SettlementResult<()> {
        self.consultation_escrows.write().await.insert(escrow.id, escrow);
        Ok(())
    }

    async fn get_consultation_escrow(&self, escrow_id: Uuid) -> SettlementResult<Option<ConsultationEscrow>> {
        Ok(self.consultation_escrows.read().await.get(&escrow_id).cloned())
    }

    async fn consultation_escrows_with_status(
        &self,
        status: ConsultationEscrowStatus,
    ) -> SettlementResult<Vec<ConsultationEscrow>> {
        Ok(self
            .consultation_escrows
            .read()
            .await
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn update_consultation_escrow_if(
        &self,
        escrow_id: Uuid,
        expected: &[ConsultationEscrowStatus],
        update: ConsultationEscrowUpdate,
    ) -> SettlementResult<Option<ConsultationEscrow>> {
        let mut escrows = self.consultation_escrows.write().await;
        let escrow = escrows
            .get_mut(&escrow_id)
            .ok_or_else(|| SettlementError::not_found(format!("Escrow {} not found", escrow_id)))?;
        if !expected.contains(&escrow.status) {
            return Ok(None);
        }
        update(escrow);
        Ok(Some(escrow.clone()))
    }

    async fn insert_queue_item(&self, mut item: PaymentQueueItem) -> SettlementResult<PaymentQueueItem> {
        item.sequence = self.queue_sequence.fetch_add(1, Ordering::SeqCst);
        self.queue.write().await.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get_queue_item(&self, item_id: Uuid) -> SettlementResult<Option<PaymentQueueItem>> {
        Ok(self.queue.read().await.get(&item_id).cloned())
    }

    async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> SettlementResult<Vec<PaymentQueueItem>> {
        let queue = self.queue.read().await;
        let mut due: Vec<PaymentQueueItem> = queue
            .values()
            .filter(|i| matches!(i.status, QueueItemStatus::Queued | QueueItemStatus::Retrying))
            .filter(|i| i.not_before <= now)
            .cloned()
            .collect();
        due.sort_by_key(|i| i.sequence);
        due.truncate(limit);
        Ok(due)
    }

    async fn queue_items(&self) -> SettlementResult<Vec<PaymentQueueItem>> {
        let mut items: Vec<PaymentQueueItem> = self.queue.read().await.values().cloned().collect();
        items.sort_by_key(|i| i.sequence);
        Ok(items)
    }

    async fn update_queue_item_if(
        &self,
        item_id: Uuid,
        expected: &[QueueItemStatus],
        update: QueueItemUpdate,
    ) -> SettlementResult<Option<PaymentQueueItem>> {
        let mut queue = self.queue.write().await;
        let item = queue
            .get_mut(&item_id)
            .ok_or_else(|| SettlementError::not_found(format!("Queue item {} not found", item_id)))?;
        if !expected.contains(&item.status) {
            return Ok(None);
        }
        update(item);
        Ok(Some(item.clone()))
    }
}
