//! Payment Queue - durable payouts with bounded retry
//!
//! Platform fees, arbitrator fees, rewards and deferred consultation payouts
//! are paid from the treasury wallet in FIFO order. A failed attempt moves the
//! item to `retrying` with linear backoff; after `max_attempts` (or on an error
//! that retrying cannot fix) it is marked `failed` and never attempted again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::QueueConfig,
    events::{EventBus, SettlementEvent},
    fees::DUST_THRESHOLD_SATS,
    models::{PaymentQueueItem, QueueItemStatus, QueueItemType, Recipient},
    repository::PaymentRepository,
    scheduler::{Clock, ScheduledJob},
    wallet::WalletManager,
    SettlementError, SettlementResult,
};

pub struct PaymentQueue {
    config: QueueConfig,
    treasury_user_id: String,
    repo: Arc<dyn PaymentRepository>,
    wallets: Arc<WalletManager>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    /// Held for the duration of a drain; overlapping drains return immediately
    drain_guard: Mutex<()>,
}

impl PaymentQueue {
    pub fn new(
        config: QueueConfig,
        treasury_user_id: String,
        repo: Arc<dyn PaymentRepository>,
        wallets: Arc<WalletManager>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            treasury_user_id,
            repo,
            wallets,
            events,
            clock,
            drain_guard: Mutex::new(()),
        }
    }

    /// Add a payout; it becomes eligible immediately
    pub async fn enqueue(
        &self,
        item_type: QueueItemType,
        recipient: &str,
        amount_sats: u64,
        reference: Option<String>,
    ) -> SettlementResult<PaymentQueueItem> {
        let recipient = self.wallets.policy().parse_address(recipient)?.to_string();
        if amount_sats < DUST_THRESHOLD_SATS {
            return Err(SettlementError::validation(format!(
                "Payout of {} sats is below the dust threshold",
                amount_sats
            )));
        }

        let now = self.clock.now();
        let item = self
            .repo
            .insert_queue_item(PaymentQueueItem {
                id: Uuid::new_v4(),
                sequence: 0,
                item_type,
                recipient,
                amount_sats,
                reference,
                status: QueueItemStatus::Queued,
                retry_count: 0,
                not_before: now,
                last_error: None,
                txid: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(
            "Queued {:?} payout {} of {} sats to {}",
            item.item_type, item.id, item.amount_sats, item.recipient
        );
        Ok(item)
    }

    /// Queue a daily reward payout
    pub async fn enqueue_daily_reward(&self, recipient: &str, amount_sats: u64) -> SettlementResult<PaymentQueueItem> {
        self.enqueue(QueueItemType::DailyReward, recipient, amount_sats, None)
            .await
    }

    /// Process up to one batch of due items; returns how many completed
    pub async fn drain(&self) -> SettlementResult<usize> {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            debug!("Queue drain already in progress");
            return Ok(0);
        };

        let due = self
            .repo
            .due_queue_items(self.clock.now(), self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!("Draining {} queued payouts", due.len());

        let mut completed = 0;
        for item in due {
            let started = self.clock.now();
            let claimed = self
                .repo
                .update_queue_item_if(
                    item.id,
                    &[QueueItemStatus::Queued, QueueItemStatus::Retrying],
                    Box::new(move |i| {
                        i.status = QueueItemStatus::Processing;
                        i.updated_at = started;
                    }),
                )
                .await?;
            let Some(claimed) = claimed else {
                continue;
            };
            if self.process(claimed).await? {
                completed += 1;
            }
        }
        Ok(completed)
    }

    pub async fn get_item(&self, item_id: Uuid) -> SettlementResult<Option<PaymentQueueItem>> {
        self.repo.get_queue_item(item_id).await
    }

    /// Every item in enqueue order
    pub async fn items(&self) -> SettlementResult<Vec<PaymentQueueItem>> {
        self.repo.queue_items().await
    }

    async fn process(&self, item: PaymentQueueItem) -> SettlementResult<bool> {
        let recipients = [Recipient::new(item.recipient.clone(), item.amount_sats)];
        match self.wallets.send(&self.treasury_user_id, &recipients, None).await {
            Ok(signed) => {
                let now = self.clock.now();
                let txid = signed.txid.clone();
                self.repo
                    .update_queue_item_if(
                        item.id,
                        &[QueueItemStatus::Processing],
                        Box::new(move |i| {
                            i.status = QueueItemStatus::Completed;
                            i.txid = Some(txid);
                            i.last_error = None;
                            i.updated_at = now;
                        }),
                    )
                    .await?;
                info!(
                    "Paid {:?} payout {} ({} sats) in {}",
                    item.item_type, item.id, item.amount_sats, signed.txid
                );
                Ok(true)
            }
            Err(e) => {
                self.record_failure(&item, e).await?;
                Ok(false)
            }
        }
    }

    async fn record_failure(&self, item: &PaymentQueueItem, err: SettlementError) -> SettlementResult<()> {
        let attempts = item.retry_count + 1;
        let now = self.clock.now();
        let message = err.to_string();
        let give_up = attempts >= self.config.max_attempts || !err.is_retryable();

        if give_up {
            let last_error = message.clone();
            self.repo
                .update_queue_item_if(
                    item.id,
                    &[QueueItemStatus::Processing],
                    Box::new(move |i| {
                        i.status = QueueItemStatus::Failed;
                        i.retry_count = attempts;
                        i.last_error = Some(last_error);
                        i.updated_at = now;
                    }),
                )
                .await?;
            error!(
                "Payout {} failed permanently after {} attempts: {}",
                item.id, attempts, message
            );
            self.events.emit(SettlementEvent::PaymentFailed {
                reference: item.reference.clone().unwrap_or_else(|| item.id.to_string()),
                item_type: Some(item.item_type),
                error: message,
            });
            return Ok(());
        }

        let not_before = now + Duration::seconds(self.config.backoff_step_secs * i64::from(attempts));
        self.repo
            .update_queue_item_if(
                item.id,
                &[QueueItemStatus::Processing],
                Box::new(move |i| {
                    i.status = QueueItemStatus::Retrying;
                    i.retry_count = attempts;
                    i.not_before = not_before;
                    i.last_error = Some(message);
                    i.updated_at = now;
                }),
            )
            .await?;
        warn!(
            "Payout {} attempt {} failed, retrying after {}",
            item.id, attempts, not_before
        );
        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for PaymentQueue {
    fn name(&self) -> &'static str {
        "queue_drain"
    }

    async fn run(&self) -> SettlementResult<usize> {
        self.drain().await
    }
}
