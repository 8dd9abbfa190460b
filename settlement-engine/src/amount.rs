//! BTC <-> satoshi conversion at the API surface
//!
//! Everything inside the engine is satoshis. Callers hand in decimal BTC,
//! which must be positive and carry at most 8 decimal places.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::{SettlementError, SettlementResult};

pub const SATS_PER_BTC: u64 = 100_000_000;

/// Convert decimal BTC into satoshis, rejecting sub-satoshi precision
pub fn btc_to_sats(btc: Decimal) -> SettlementResult<u64> {
    if btc.is_sign_negative() || btc.is_zero() {
        return Err(SettlementError::validation(format!(
            "Amount must be greater than 0, got {}",
            btc
        )));
    }

    let normalized = btc.normalize();
    if normalized.scale() > 8 {
        return Err(SettlementError::validation(format!(
            "Amount {} has more than 8 decimal places",
            btc
        )));
    }

    (normalized * Decimal::from(SATS_PER_BTC))
        .to_u64()
        .ok_or_else(|| SettlementError::validation(format!("Amount {} out of range", btc)))
}

/// Convert satoshis into decimal BTC with 8-place scale
pub fn sats_to_btc(sats: u64) -> Decimal {
    Decimal::from_i128_with_scale(sats as i128, 8)
}

/// `amount * bps / 10_000`, rounded half up
pub fn apply_bps(amount_sats: u64, bps: u32) -> u64 {
    ((amount_sats as u128 * bps as u128 + 5_000) / 10_000) as u64
}

/// `amount * percent / 100`, rounded half up
pub fn apply_percent(amount_sats: u64, percent: u8) -> u64 {
    apply_bps(amount_sats, percent as u32 * 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_btc_to_sats() {
        assert_eq!(btc_to_sats(Decimal::from_str("0.01").unwrap()).unwrap(), 1_000_000);
        assert_eq!(btc_to_sats(Decimal::from_str("1").unwrap()).unwrap(), SATS_PER_BTC);
        assert_eq!(btc_to_sats(Decimal::from_str("0.00000001").unwrap()).unwrap(), 1);
        assert_eq!(btc_to_sats(Decimal::from_str("0.010000000").unwrap()).unwrap(), 1_000_000);
    }

    #[test]
    fn test_rejects_bad_amounts() {
        assert!(btc_to_sats(Decimal::ZERO).is_err());
        assert!(btc_to_sats(Decimal::from_str("-0.5").unwrap()).is_err());
        match btc_to_sats(Decimal::from_str("0.000000001").unwrap()) {
            Err(SettlementError::Validation(msg)) => assert!(msg.contains("8 decimal places")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_sats_to_btc() {
        assert_eq!(sats_to_btc(970_000), Decimal::from_str("0.0097").unwrap());
        assert_eq!(sats_to_btc(30_000).to_string(), "0.00030000");
    }

    #[test]
    fn test_bps_split_sums_to_amount() {
        for amount in [1u64, 333, 1_000_000, 123_456_789] {
            let fee = apply_bps(amount, 300);
            let doctor = amount - fee;
            assert_eq!(doctor + fee, amount);
        }
        assert_eq!(apply_bps(1_000_000, 300), 30_000);
        assert_eq!(apply_percent(1_000_000, 90), 900_000);
    }
}
