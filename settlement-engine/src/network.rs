//! Network policy
//!
//! Everything that differs between mainnet and test networks lives here and
//! is decided once at construction: address validation, derivation coin
//! type, fallback fee rates and the arbitrator selection strategy.

use std::str::FromStr;

use bitcoin::{bip32::DerivationPath, Address, Network};
use rand::Rng;

use crate::{SettlementError, SettlementResult};

/// How an arbitrator is picked for a new multisig escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitratorSelection {
    /// Uniformly at random among configured arbitrators
    Random,
    /// Always the arbitrator at this index (tests, single-arbitrator setups)
    Fixed(usize),
}

/// Per-network behaviour chosen once when the engine is built
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    network: Network,
    arbitrator_selection: ArbitratorSelection,
}

impl NetworkPolicy {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            arbitrator_selection: ArbitratorSelection::Random,
        }
    }

    pub fn with_arbitrator_selection(mut self, selection: ArbitratorSelection) -> Self {
        self.arbitrator_selection = selection;
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_mainnet(&self) -> bool {
        self.network == Network::Bitcoin
    }

    /// Parse an address and require it to belong to the active network
    pub fn parse_address(&self, address: &str) -> SettlementResult<Address> {
        let unchecked = Address::from_str(address.trim())?;
        unchecked.require_network(self.network).map_err(|_| {
            SettlementError::validation(format!(
                "Address {} is not valid for network {}",
                address, self.network
            ))
        })
    }

    /// BIP84 coin type: 0 on mainnet, 1 on every test network
    pub fn coin_type(&self) -> u32 {
        if self.is_mainnet() {
            0
        } else {
            1
        }
    }

    /// Fixed single-key derivation path `m/84'/coin'/0'/0/index`
    pub fn derivation_path(&self, index: u32) -> SettlementResult<DerivationPath> {
        DerivationPath::from_str(&format!("m/84'/{}'/0'/0/{}", self.coin_type(), index))
            .map_err(SettlementError::from)
    }

    /// Static sat/vB used when the fee oracle is unavailable
    pub fn fallback_fee_rate(&self) -> u64 {
        match self.network {
            Network::Bitcoin => 20,
            Network::Regtest => 1,
            _ => 2,
        }
    }

    /// Never pay less than this, whatever the oracle says
    pub fn min_fee_rate(&self) -> u64 {
        1
    }

    /// Pick an arbitrator index among `count` configured arbitrators
    pub fn select_arbitrator(&self, count: usize) -> SettlementResult<usize> {
        if count == 0 {
            return Err(SettlementError::config("No arbitrators configured"));
        }
        match self.arbitrator_selection {
            ArbitratorSelection::Random => Ok(rand::thread_rng().gen_range(0..count)),
            ArbitratorSelection::Fixed(index) if index < count => Ok(index),
            ArbitratorSelection::Fixed(index) => Err(SettlementError::config(format!(
                "Arbitrator index {} out of range ({} configured)",
                index, count
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINNET_ADDR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
    const TESTNET_ADDR: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    #[test]
    fn test_mainnet_address_rejected_on_testnet() {
        let policy = NetworkPolicy::new(Network::Testnet);
        assert!(policy.parse_address(TESTNET_ADDR).is_ok());
        match policy.parse_address(MAINNET_ADDR) {
            Err(SettlementError::Validation(msg)) => assert!(msg.contains("not valid")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_testnet_address_rejected_on_mainnet() {
        let policy = NetworkPolicy::new(Network::Bitcoin);
        assert!(policy.parse_address(MAINNET_ADDR).is_ok());
        assert!(policy.parse_address(TESTNET_ADDR).is_err());
    }

    #[test]
    fn test_garbage_address_rejected() {
        let policy = NetworkPolicy::new(Network::Testnet);
        assert!(matches!(
            policy.parse_address("not-an-address"),
            Err(SettlementError::Validation(_))
        ));
    }

    #[test]
    fn test_derivation_path_coin_type() {
        let main = NetworkPolicy::new(Network::Bitcoin);
        let test = NetworkPolicy::new(Network::Testnet);
        assert_eq!(
            main.derivation_path(0).unwrap(),
            DerivationPath::from_str("m/84'/0'/0'/0/0").unwrap()
        );
        assert_eq!(
            test.derivation_path(3).unwrap(),
            DerivationPath::from_str("m/84'/1'/0'/0/3").unwrap()
        );
    }

    #[test]
    fn test_arbitrator_selection() {
        let fixed = NetworkPolicy::new(Network::Regtest)
            .with_arbitrator_selection(ArbitratorSelection::Fixed(1));
        assert_eq!(fixed.select_arbitrator(3).unwrap(), 1);
        assert!(fixed.select_arbitrator(1).is_err());

        let random = NetworkPolicy::new(Network::Regtest);
        for _ in 0..50 {
            assert!(random.select_arbitrator(3).unwrap() < 3);
        }
        assert!(random.select_arbitrator(0).is_err());
    }
}
