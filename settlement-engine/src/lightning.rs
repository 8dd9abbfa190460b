//! Lightning rail
//!
//! The payment processor only needs three things from a Lightning node:
//! how much it can send, an invoice for a payee, and a bounded-time payment.
//! [`LdkLightningClient`] provides them from an embedded LDK node.

use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use ldk_node::{
    lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescription, Description},
    payment::PaymentStatus,
    Node,
};
use tracing::{info, warn};

use crate::{SettlementError, SettlementResult};

/// Spendable channel liquidity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBalance {
    pub connected: bool,
    pub outbound_sats: u64,
}

/// Completed Lightning payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightningPayment {
    pub payment_hash: String,
    pub fee_sats: u64,
}

/// Lightning node operations used for settlement
#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn get_channel_balance(&self) -> SettlementResult<ChannelBalance>;

    /// BOLT11 payment request for `amount_sats`
    async fn create_invoice(&self, amount_sats: u64, memo: &str) -> SettlementResult<String>;

    /// Pay and wait for the outcome, failing with `Timeout` after `timeout`
    async fn pay_invoice(&self, payment_request: &str, timeout: Duration) -> SettlementResult<LightningPayment>;
}

/// LDK-backed Lightning client
pub struct LdkLightningClient {
    node: Arc<Node>,
    invoice_expiry_secs: u32,
    poll_interval: Duration,
}

impl LdkLightningClient {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            invoice_expiry_secs: 3600,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl LightningClient for LdkLightningClient {
    async fn get_channel_balance(&self) -> SettlementResult<ChannelBalance> {
        let channels = self.node.list_channels();
        let outbound_sats = channels
            .iter()
            .filter(|c| c.is_usable)
            .map(|c| c.outbound_capacity_msat / 1000)
            .sum();

        Ok(ChannelBalance {
            connected: self.node.status().is_running && channels.iter().any(|c| c.is_usable),
            outbound_sats,
        })
    }

    async fn create_invoice(&self, amount_sats: u64, memo: &str) -> SettlementResult<String> {
        let description = Description::new(memo.to_string())
            .map_err(|e| SettlementError::validation(format!("Invalid invoice memo: {}", e)))?;
        let invoice = self
            .node
            .bolt11_payment()
            .receive(
                amount_sats * 1000,
                &Bolt11InvoiceDescription::Direct(description),
                self.invoice_expiry_secs,
            )
            .map_err(|e| SettlementError::network(format!("Failed to create invoice: {}", e)))?;

        Ok(invoice.to_string())
    }

    async fn pay_invoice(&self, payment_request: &str, timeout: Duration) -> SettlementResult<LightningPayment> {
        let invoice = Bolt11Invoice::from_str(payment_request)
            .map_err(|e| SettlementError::validation(format!("Invalid payment request: {}", e)))?;
        let payment_hash = invoice.payment_hash().to_string();

        let payment_id = self
            .node
            .bolt11_payment()
            .send(&invoice, None)
            .map_err(|e| SettlementError::network(format!("Lightning send failed: {}", e)))?;

        let node = self.node.clone();
        let poll_interval = self.poll_interval;
        let outcome = tokio::time::timeout(timeout, async move {
            loop {
                match node.payment(&payment_id).map(|p| (p.status, p.fee_paid_msat)) {
                    Some((PaymentStatus::Succeeded, fee_msat)) => {
                        return Ok(fee_msat.unwrap_or(0).div_ceil(1000));
                    }
                    Some((PaymentStatus::Failed, _)) => {
                        return Err(SettlementError::network("Lightning payment failed"));
                    }
                    _ => tokio::time::sleep(poll_interval).await,
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(fee_sats)) => {
                info!("Lightning payment {} settled (fee {} sats)", payment_hash, fee_sats);
                Ok(LightningPayment { payment_hash, fee_sats })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Lightning payment {} still pending after {:?}", payment_hash, timeout);
                Err(SettlementError::timeout(format!(
                    "Lightning payment {} timed out after {:?}",
                    payment_hash, timeout
                )))
            }
        }
    }
}
