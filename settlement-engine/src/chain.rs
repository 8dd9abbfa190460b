//! Chain access - UTXO/balance indexer and transaction broadcaster
//!
//! The engine only talks to the chain through [`ChainBackend`]. The
//! production implementation speaks the Esplora REST API over `reqwest`;
//! the same client doubles as a fee-rate source.

use std::{collections::HashMap, str::FromStr, time::Duration};

use async_trait::async_trait;
use bitcoin::Address;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    config::ChainConfig,
    fees::FeeRateSource,
    models::{Balance, Utxo},
    SettlementError, SettlementResult,
};

/// UTXO indexer + broadcaster
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Confirmed and unconfirmed balance of an address
    async fn get_balance(&self, address: &str) -> SettlementResult<Balance>;

    /// Unspent outputs currently locked to an address
    async fn get_utxos(&self, address: &str) -> SettlementResult<Vec<Utxo>>;

    /// Submit a raw transaction, returning its txid
    async fn broadcast(&self, tx_hex: &str) -> SettlementResult<String>;

    /// Current best block height
    async fn tip_height(&self) -> SettlementResult<u32>;
}

/// Esplora REST client
pub struct EsploraClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EsploraAddressStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraAddress {
    chain_stats: EsploraAddressStats,
    mempool_stats: EsploraAddressStats,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraStatus,
}

impl EsploraClient {
    pub fn new(config: &ChainConfig) -> SettlementResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SettlementError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.esplora_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> SettlementResult<T> {
        let response = self.http.get(self.url(path)).send().await?;
        if !response.status().is_success() {
            return Err(SettlementError::network(format!(
                "Esplora GET {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ChainBackend for EsploraClient {
    async fn get_balance(&self, address: &str) -> SettlementResult<Balance> {
        let info: EsploraAddress = self.get_json(&format!("/address/{}", address)).await?;
        Ok(Balance {
            confirmed_sats: info
                .chain_stats
                .funded_txo_sum
                .saturating_sub(info.chain_stats.spent_txo_sum),
            unconfirmed_sats: info
                .mempool_stats
                .funded_txo_sum
                .saturating_sub(info.mempool_stats.spent_txo_sum),
        })
    }

    async fn get_utxos(&self, address: &str) -> SettlementResult<Vec<Utxo>> {
        let script_pubkey = Address::from_str(address)?.assume_checked().script_pubkey();
        let utxos: Vec<EsploraUtxo> = self.get_json(&format!("/address/{}/utxo", address)).await?;
        let tip = self.tip_height().await?;

        Ok(utxos
            .into_iter()
            .map(|u| {
                let confirmations = match (u.status.confirmed, u.status.block_height) {
                    (true, Some(height)) if tip >= height => tip - height + 1,
                    _ => 0,
                };
                Utxo {
                    txid: u.txid,
                    vout: u.vout,
                    value_sats: u.value,
                    script_pubkey: script_pubkey.clone(),
                    confirmations,
                }
            })
            .collect())
    }

    async fn broadcast(&self, tx_hex: &str) -> SettlementResult<String> {
        let response = self
            .http
            .post(self.url("/tx"))
            .body(tx_hex.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            debug!("Broadcast accepted: {}", body);
            Ok(body.trim().to_string())
        } else if status.is_client_error() {
            // 4xx carries the node's reject reason (missing inputs, min relay fee, ...)
            warn!("Broadcast rejected ({}): {}", status, body);
            Err(SettlementError::broadcast_rejected(body))
        } else {
            Err(SettlementError::network(format!("Broadcast failed with {}: {}", status, body)))
        }
    }

    async fn tip_height(&self) -> SettlementResult<u32> {
        let response = self.http.get(self.url("/blocks/tip/height")).send().await?;
        if !response.status().is_success() {
            return Err(SettlementError::network(format!(
                "Esplora tip height returned {}",
                response.status()
            )));
        }
        let text = response.text().await?;
        text.trim()
            .parse::<u32>()
            .map_err(|_| SettlementError::network(format!("Unexpected tip height response: {}", text)))
    }
}

#[async_trait]
impl FeeRateSource for EsploraClient {
    async fn fee_rate(&self, target_blocks: u16) -> SettlementResult<f64> {
        let estimates: HashMap<String, f64> = self.get_json("/fee-estimates").await?;

        // Closest available target at or above the requested one
        let mut best: Option<(u16, f64)> = None;
        for (target, rate) in estimates {
            let Ok(target) = target.parse::<u16>() else { continue };
            if target < target_blocks {
                continue;
            }
            if best.map_or(true, |(t, _)| target < t) {
                best = Some((target, rate));
            }
        }

        best.map(|(_, rate)| rate)
            .ok_or_else(|| SettlementError::network(format!("No fee estimate for {} blocks", target_blocks)))
    }
}
