//! Fee estimation
//!
//! `vsize = base + inputs * per_input + outputs * per_output` and
//! `fee = vsize * rate`. The rate comes from a [`FeeRateSource`] when one is
//! reachable, otherwise from the network policy's static fallback.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::{network::NetworkPolicy, SettlementResult};

/// Outputs below this are uneconomical to spend; change this small folds into the fee
pub const DUST_THRESHOLD_SATS: u64 = 546;

/// Upper bound on any fee rate used for a spend, in sat/vB
pub const MAX_FEE_RATE_SAT_VB: u64 = 10_000;

/// Version, locktime, counts and segwit marker, rounded up
pub const BASE_OVERHEAD_VBYTES: u64 = 11;
/// P2WPKH output
pub const OUTPUT_VBYTES: u64 = 31;

/// Kind of input being spent; witness size differs a lot between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Single-key witness: signature + pubkey
    P2wpkh,
    /// 2-of-3 witness script: dummy + two signatures + script
    P2wshMultisig,
}

impl InputKind {
    pub fn vbytes(&self) -> u64 {
        match self {
            Self::P2wpkh => 68,
            Self::P2wshMultisig => 105,
        }
    }
}

/// Estimated virtual size of a transaction
pub fn estimate_vsize(kind: InputKind, inputs: usize, outputs: usize) -> u64 {
    BASE_OVERHEAD_VBYTES + inputs as u64 * kind.vbytes() + outputs as u64 * OUTPUT_VBYTES
}

/// Estimated fee in sats at `fee_rate` sat/vB; saturates instead of overflowing
pub fn estimate_fee(kind: InputKind, inputs: usize, outputs: usize, fee_rate: u64) -> u64 {
    estimate_vsize(kind, inputs, outputs).saturating_mul(fee_rate)
}

/// Fee quote for a transaction shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeEstimate {
    pub vsize: u64,
    pub fee_rate: u64,
    pub fee_sats: u64,
}

impl FeeEstimate {
    pub fn new(kind: InputKind, inputs: usize, outputs: usize, fee_rate: u64) -> Self {
        Self {
            vsize: estimate_vsize(kind, inputs, outputs),
            fee_rate,
            fee_sats: estimate_fee(kind, inputs, outputs, fee_rate),
        }
    }
}

/// Recommended sat/vB for a confirmation target
#[async_trait]
pub trait FeeRateSource: Send + Sync {
    async fn fee_rate(&self, target_blocks: u16) -> SettlementResult<f64>;
}

/// Resolves the fee rate to use for a send
pub struct FeeEstimator {
    source: Option<Arc<dyn FeeRateSource>>,
    policy: NetworkPolicy,
}

impl FeeEstimator {
    pub fn new(source: Option<Arc<dyn FeeRateSource>>, policy: NetworkPolicy) -> Self {
        Self { source, policy }
    }

    /// Oracle rate rounded up and capped, or the static fallback if the oracle fails
    pub async fn recommended_rate(&self, target_blocks: u16) -> u64 {
        let Some(source) = &self.source else {
            return self.policy.fallback_fee_rate();
        };

        match source.fee_rate(target_blocks).await {
            Ok(rate) if rate.is_finite() && rate > 0.0 => {
                if rate > MAX_FEE_RATE_SAT_VB as f64 {
                    warn!("Fee oracle rate {} sat/vB capped at {}", rate, MAX_FEE_RATE_SAT_VB);
                }
                self.clamp(rate.ceil().min(MAX_FEE_RATE_SAT_VB as f64) as u64)
            }
            Ok(rate) => {
                warn!("Fee oracle returned unusable rate {}, using fallback", rate);
                self.policy.fallback_fee_rate()
            }
            Err(e) => {
                warn!("Fee oracle unavailable ({}), using fallback", e);
                self.policy.fallback_fee_rate()
            }
        }
    }

    /// Explicit rates are honoured but clamped to the policy minimum and the cap
    pub async fn resolve_rate(&self, explicit: Option<u64>, target_blocks: u16) -> u64 {
        match explicit {
            Some(rate) => self.clamp(rate),
            None => self.recommended_rate(target_blocks).await,
        }
    }

    fn clamp(&self, rate: u64) -> u64 {
        rate.clamp(self.policy.min_fee_rate(), MAX_FEE_RATE_SAT_VB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SettlementError;
    use bitcoin::Network;

    struct FixedRate(Option<f64>);

    #[async_trait]
    impl FeeRateSource for FixedRate {
        async fn fee_rate(&self, _target_blocks: u16) -> SettlementResult<f64> {
            self.0.ok_or_else(|| SettlementError::network("oracle down"))
        }
    }

    #[test]
    fn test_fee_monotonic_in_inputs_and_outputs() {
        for kind in [InputKind::P2wpkh, InputKind::P2wshMultisig] {
            for inputs in 1..8 {
                for outputs in 1..5 {
                    let fee = estimate_fee(kind, inputs, outputs, 5);
                    assert!(estimate_fee(kind, inputs + 1, outputs, 5) > fee);
                    assert!(estimate_fee(kind, inputs, outputs + 1, 5) > fee);
                }
            }
        }
    }

    #[test]
    fn test_single_input_two_output_size() {
        assert_eq!(estimate_vsize(InputKind::P2wpkh, 1, 2), 11 + 68 + 62);
        assert_eq!(estimate_fee(InputKind::P2wpkh, 1, 2, 10), 1410);
    }

    #[tokio::test]
    async fn test_oracle_rate_rounds_up() {
        let estimator = FeeEstimator::new(
            Some(Arc::new(FixedRate(Some(3.2)))),
            NetworkPolicy::new(Network::Testnet),
        );
        assert_eq!(estimator.recommended_rate(6).await, 4);
    }

    #[tokio::test]
    async fn test_absurd_rates_are_capped() {
        let estimator = FeeEstimator::new(
            Some(Arc::new(FixedRate(Some(1e30)))),
            NetworkPolicy::new(Network::Testnet),
        );
        assert_eq!(estimator.recommended_rate(6).await, MAX_FEE_RATE_SAT_VB);
        assert_eq!(estimator.resolve_rate(Some(u64::MAX), 6).await, MAX_FEE_RATE_SAT_VB);
        assert_eq!(estimate_fee(InputKind::P2wshMultisig, 3, 3, u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_fallback_when_oracle_down() {
        let estimator = FeeEstimator::new(
            Some(Arc::new(FixedRate(None))),
            NetworkPolicy::new(Network::Bitcoin),
        );
        assert_eq!(estimator.recommended_rate(6).await, 20);

        let no_oracle = FeeEstimator::new(None, NetworkPolicy::new(Network::Testnet));
        assert_eq!(no_oracle.recommended_rate(6).await, 2);
        assert_eq!(no_oracle.resolve_rate(Some(0), 6).await, 1);
        assert_eq!(no_oracle.resolve_rate(Some(12), 6).await, 12);
    }
}
