//! Settlement Node - wiring and lifecycle
//!
//! Builds every component from a [`SettlementConfig`] and a set of backends,
//! registers the background jobs and exposes health and shutdown.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    chain::ChainBackend,
    config::SettlementConfig,
    events::{EventBus, EventEnvelope},
    fees::FeeRateSource,
    lightning::LightningClient,
    multisig::{DisputeSweepJob, FundingMonitorJob, MultisigEscrowManager},
    network::NetworkPolicy,
    processor::{EscrowExpiryJob, PaymentProcessor},
    queue::PaymentQueue,
    repository::{EscrowRepository, PaymentRepository, WalletRepository},
    scheduler::{Clock, Scheduler, SystemClock},
    wallet::WalletManager,
    SettlementResult,
};

/// External services the node talks to
#[derive(Clone)]
pub struct NodeBackends {
    pub chain: Arc<dyn ChainBackend>,
    pub fee_source: Option<Arc<dyn FeeRateSource>>,
    pub lightning: Option<Arc<dyn LightningClient>>,
    pub clock: Arc<dyn Clock>,
}

impl NodeBackends {
    pub fn new(chain: Arc<dyn ChainBackend>) -> Self {
        Self {
            chain,
            fee_source: None,
            lightning: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_fee_source(mut self, fee_source: Arc<dyn FeeRateSource>) -> Self {
        self.fee_source = Some(fee_source);
        self
    }

    pub fn with_lightning(mut self, lightning: Arc<dyn LightningClient>) -> Self {
        self.lightning = Some(lightning);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Node health status
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub chain_tip: Option<u32>,
    pub lightning_outbound_sats: Option<u64>,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// The settlement engine with its background jobs
pub struct SettlementNode {
    config: SettlementConfig,
    chain: Arc<dyn ChainBackend>,
    lightning: Option<Arc<dyn LightningClient>>,
    events: EventBus,
    wallets: Arc<WalletManager>,
    queue: Arc<PaymentQueue>,
    multisig: Arc<MultisigEscrowManager>,
    processor: Arc<PaymentProcessor>,
    scheduler: Mutex<Scheduler>,
}

impl SettlementNode {
    /// Build every component over one store and register the periodic jobs
    pub async fn new<S>(config: SettlementConfig, store: Arc<S>, backends: NodeBackends) -> SettlementResult<Self>
    where
        S: WalletRepository + EscrowRepository + PaymentRepository + 'static,
    {
        config.validate()?;
        info!("Initializing settlement node on {}", config.network);

        let events = EventBus::default();
        let policy = NetworkPolicy::new(config.network);

        let wallets = Arc::new(WalletManager::new(
            config.wallet.clone(),
            policy,
            store.clone(),
            backends.chain.clone(),
            backends.fee_source.clone(),
            events.clone(),
            backends.clock.clone(),
        )?);
        let queue = Arc::new(PaymentQueue::new(
            config.queue.clone(),
            config.processor.treasury_user_id.clone(),
            store.clone(),
            wallets.clone(),
            events.clone(),
            backends.clock.clone(),
        ));
        let multisig = Arc::new(MultisigEscrowManager::new(
            config.escrow.clone(),
            config.policy.clone(),
            wallets.clone(),
            backends.chain.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
            backends.clock.clone(),
        )?);
        let processor = Arc::new(PaymentProcessor::new(
            config.processor.clone(),
            config.policy.clone(),
            wallets.clone(),
            backends.lightning.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
            backends.clock.clone(),
        ));

        let treasury = wallets
            .create_wallet(&config.processor.treasury_user_id, None)
            .await?;
        info!("Treasury wallet at {}", treasury.address);

        let intervals = &config.scheduler;
        let mut scheduler = Scheduler::new();
        scheduler.register(
            Arc::new(FundingMonitorJob(multisig.clone())),
            Duration::from_secs(intervals.funding_monitor_secs),
        );
        scheduler.register(
            Arc::new(DisputeSweepJob(multisig.clone())),
            Duration::from_secs(intervals.dispute_sweep_secs),
        );
        scheduler.register(queue.clone(), Duration::from_secs(intervals.queue_drain_secs));
        scheduler.register(
            Arc::new(EscrowExpiryJob(processor.clone())),
            Duration::from_secs(intervals.escrow_expiry_secs),
        );

        Ok(Self {
            config,
            chain: backends.chain,
            lightning: backends.lightning,
            events,
            wallets,
            queue,
            multisig,
            processor,
            scheduler: Mutex::new(scheduler),
        })
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn wallets(&self) -> &Arc<WalletManager> {
        &self.wallets
    }

    pub fn multisig(&self) -> &Arc<MultisigEscrowManager> {
        &self.multisig
    }

    pub fn processor(&self) -> &Arc<PaymentProcessor> {
        &self.processor
    }

    pub fn queue(&self) -> &Arc<PaymentQueue> {
        &self.queue
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Start the periodic jobs on the tokio runtime
    pub async fn start(&self) {
        self.scheduler.lock().await.start();
    }

    /// Run every job once, regardless of its interval
    pub async fn run_jobs_once(&self) -> Vec<(&'static str, SettlementResult<usize>)> {
        self.scheduler.lock().await.run_due().await
    }

    /// Check that the indexer and the Lightning node answer
    pub async fn health_check(&self) -> SettlementResult<NodeHealth> {
        let mut issues = Vec::new();

        let chain_tip = match self.chain.tip_height().await {
            Ok(height) => Some(height),
            Err(e) => {
                issues.push(format!("Chain backend error: {}", e));
                None
            }
        };

        let lightning_outbound_sats = match &self.lightning {
            Some(lightning) => match lightning.get_channel_balance().await {
                Ok(balance) if balance.connected => Some(balance.outbound_sats),
                Ok(_) => {
                    issues.push("Lightning node has no usable channels".to_string());
                    Some(0)
                }
                Err(e) => {
                    issues.push(format!("Lightning node error: {}", e));
                    None
                }
            },
            None => None,
        };

        if !issues.is_empty() {
            warn!("Health check found {} issues", issues.len());
        }
        Ok(NodeHealth {
            healthy: issues.is_empty(),
            chain_tip,
            lightning_outbound_sats,
            issues,
            timestamp: Utc::now(),
        })
    }

    /// Stop the background jobs and wait for in-flight passes to finish
    pub async fn shutdown(&self) -> SettlementResult<()> {
        info!("Shutting down settlement node");
        self.scheduler.lock().await.shutdown().await;
        info!("Settlement node shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::EscrowStatus,
        repository::InMemoryStore,
        scheduler::ManualClock,
        testing::{test_config, MockChain, MockLightning},
    };
    use rust_decimal::Decimal;
    use std::str::FromStr;

    async fn test_node(lightning: MockLightning) -> (SettlementNode, Arc<MockChain>) {
        let config = test_config();
        let chain = Arc::new(MockChain::new(config.network));
        let backends = NodeBackends::new(chain.clone())
            .with_lightning(Arc::new(lightning))
            .with_clock(Arc::new(ManualClock::new(Utc::now())));
        let node = SettlementNode::new(config, Arc::new(InMemoryStore::new()), backends)
            .await
            .unwrap();
        (node, chain)
    }

    #[tokio::test]
    async fn test_node_health_check() {
        let (node, chain) = test_node(MockLightning::new(true, 50_000)).await;
        let health = node.health_check().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.chain_tip, Some(100));
        assert_eq!(health.lightning_outbound_sats, Some(50_000));

        chain.set_offline(true);
        let health = node.health_check().await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_lightning_is_unhealthy() {
        let (node, _) = test_node(MockLightning::new(false, 0)).await;
        let health = node.health_check().await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.chain_tip, Some(100));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = test_config();
        config.wallet.vault_master_secret = "short".to_string();
        let chain = Arc::new(MockChain::new(config.network));
        let result = SettlementNode::new(config, Arc::new(InMemoryStore::new()), NodeBackends::new(chain)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_jobs_drive_funding() {
        let (node, chain) = test_node(MockLightning::new(true, 0)).await;
        {
            let scheduler = node.scheduler.lock().await;
            assert_eq!(
                scheduler.job_names(),
                vec!["funding_monitor", "dispute_sweep", "queue_drain", "escrow_expiry"]
            );
        }

        let patient = node.wallets().create_wallet("patient-1", None).await.unwrap();
        let doctor = node.wallets().create_wallet("doctor-1", None).await.unwrap();
        let funding = node
            .multisig()
            .create_escrow(
                "consult-1",
                &patient.address,
                &doctor.address,
                Decimal::from_str("0.01").unwrap(),
                None,
            )
            .await
            .unwrap();
        chain.fund(&funding.address, funding.amount_sats);

        let results = node.run_jobs_once().await;
        assert_eq!(results[0].0, "funding_monitor");
        assert_eq!(*results[0].1.as_ref().unwrap(), 1);

        let escrow = node.multisig().get_escrow(funding.escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Funded);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (node, _) = test_node(MockLightning::new(true, 0)).await;
        node.start().await;
        node.shutdown().await.unwrap();
    }
}
