//! Test doubles shared by the module tests
//!
//! [`MockChain`] keeps a real UTXO set: broadcasts are decoded, every input
//! must exist and carry a valid segwit v0 signature for its prevout, and
//! spent outputs are removed so double-spends are rejected.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{
    ecdsa,
    hashes::Hash,
    script::Instruction,
    secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    Address, CompressedPublicKey, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid,
};
use chrono::Utc;

use crate::{
    chain::ChainBackend,
    config::{ArbitratorConfig, SettlementConfig},
    events::EventBus,
    lightning::{ChannelBalance, LightningClient, LightningPayment},
    models::{Balance, Utxo},
    multisig::MultisigEscrowManager,
    network::{ArbitratorSelection, NetworkPolicy},
    processor::PaymentProcessor,
    queue::PaymentQueue,
    repository::InMemoryStore,
    scheduler::ManualClock,
    wallet::WalletManager,
    SettlementError, SettlementResult,
};

/// Deterministic secret key from a single byte
pub fn secret_key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

/// Regtest P2WPKH address of [`secret_key`]
pub fn key_address(byte: u8) -> String {
    let secp = Secp256k1::new();
    let public = CompressedPublicKey(secret_key(byte).public_key(&secp));
    Address::p2wpkh(&public, Network::Regtest).to_string()
}

/// Regtest configuration with three arbitrators and cheap key stretching
pub fn test_config() -> SettlementConfig {
    let mut config = SettlementConfig::default();
    config.network = Network::Regtest;
    config.wallet.vault_master_secret = "test-master-secret-0123456789".to_string();
    config.wallet.kdf_memory_kib = 64;
    config.wallet.kdf_iterations = 1;
    config.escrow.arbitrators = (0..3u8)
        .map(|i| ArbitratorConfig {
            id: format!("arb-{}", i + 1),
            secret_key: hex::encode(secret_key(0x11 + i).secret_bytes()),
            payout_address: key_address(0x21 + i),
        })
        .collect();
    config.escrow.platform_fee_address = key_address(0x31);
    config.processor.platform_fee_address = key_address(0x31);
    config.processor.lightning_timeout_secs = 1;
    config
}

#[derive(Default)]
struct ChainState {
    utxos: HashMap<OutPoint, (TxOut, u32)>,
    broadcasts: Vec<Transaction>,
    offline: bool,
    reject_broadcasts: usize,
    tip: u32,
}

/// In-memory chain with UTXO bookkeeping and signature checks
pub struct MockChain {
    network: Network,
    secp: Secp256k1<All>,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::new(),
            state: Mutex::new(ChainState {
                tip: 100,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    fn script_for(&self, address: &str) -> ScriptBuf {
        Address::from_str(address)
            .unwrap()
            .require_network(self.network)
            .unwrap()
            .script_pubkey()
    }

    /// Credit a confirmed output to `address`, returning the funding txid
    pub fn fund(&self, address: &str, sats: u64) -> String {
        self.fund_with_confirmations(address, sats, 1)
    }

    pub fn fund_unconfirmed(&self, address: &str, sats: u64) -> String {
        self.fund_with_confirmations(address, sats, 0)
    }

    fn fund_with_confirmations(&self, address: &str, sats: u64, confirmations: u32) -> String {
        let txid = Txid::from_byte_array(rand::random::<[u8; 32]>());
        let output = TxOut {
            value: bitcoin::Amount::from_sat(sats),
            script_pubkey: self.script_for(address),
        };
        self.state()
            .utxos
            .insert(OutPoint::new(txid, 0), (output, confirmations));
        txid.to_string()
    }

    /// Every call fails with a network error while offline
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Reject the next `count` broadcasts as if the mempool refused them
    pub fn reject_next_broadcasts(&self, count: usize) {
        self.state().reject_broadcasts = count;
    }

    pub fn broadcast_count(&self) -> usize {
        self.state().broadcasts.len()
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state().broadcasts.clone()
    }

    /// Total paid to `address` by broadcast transactions
    pub fn received_by(&self, address: &str) -> u64 {
        let script = self.script_for(address);
        self.state()
            .broadcasts
            .iter()
            .flat_map(|tx| tx.output.iter())
            .filter(|o| o.script_pubkey == script)
            .map(|o| o.value.to_sat())
            .sum()
    }

    /// Mine a block: every unspent output gains a confirmation
    pub fn mine(&self) {
        let mut state = self.state();
        state.tip += 1;
        for (_, confirmations) in state.utxos.values_mut() {
            *confirmations += 1;
        }
    }

    fn verify_inputs(&self, tx: &Transaction, prevouts: &[TxOut]) -> SettlementResult<()> {
        let mut cache = SighashCache::new(tx);
        for (index, (input, prevout)) in tx.input.iter().zip(prevouts).enumerate() {
            let witness = &input.witness;
            if prevout.script_pubkey.is_p2wpkh() {
                let (Some(sig), Some(key), 2) = (witness.nth(0), witness.nth(1), witness.len()) else {
                    return Err(rejected(index, "malformed p2wpkh witness"));
                };
                let key = CompressedPublicKey::from_slice(key).map_err(|_| rejected(index, "bad pubkey"))?;
                if ScriptBuf::new_p2wpkh(&key.wpubkey_hash()) != prevout.script_pubkey {
                    return Err(rejected(index, "pubkey does not own prevout"));
                }
                let sighash = cache
                    .p2wpkh_signature_hash(index, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
                    .map_err(|e| rejected(index, &e.to_string()))?;
                self.verify_sig(sig, &key.0, sighash.to_byte_array())
                    .map_err(|_| rejected(index, "bad signature"))?;
            } else if prevout.script_pubkey.is_p2wsh() {
                if witness.len() != 4 || witness.nth(0).map(|d| !d.is_empty()).unwrap_or(true) {
                    return Err(rejected(index, "malformed multisig witness"));
                }
                let script = ScriptBuf::from_bytes(witness.last().unwrap_or_default().to_vec());
                if ScriptBuf::new_p2wsh(&script.wscript_hash()) != prevout.script_pubkey {
                    return Err(rejected(index, "witness script does not match prevout"));
                }
                let keys: Vec<PublicKey> = script
                    .instructions()
                    .filter_map(|i| match i {
                        Ok(Instruction::PushBytes(bytes)) => PublicKey::from_slice(bytes.as_bytes()).ok(),
                        _ => None,
                    })
                    .collect();
                let sighash = cache
                    .p2wsh_signature_hash(index, &script, prevout.value, EcdsaSighashType::All)
                    .map_err(|e| rejected(index, &e.to_string()))?
                    .to_byte_array();

                // OP_CHECKMULTISIG: signatures must follow key order
                let mut remaining = keys.iter();
                for sig in [witness.nth(1), witness.nth(2)] {
                    let sig = sig.unwrap_or_default();
                    if !remaining.any(|key| self.verify_sig(sig, key, sighash).is_ok()) {
                        return Err(rejected(index, "multisig signature check failed"));
                    }
                }
            } else {
                return Err(rejected(index, "unsupported prevout script"));
            }
        }
        Ok(())
    }

    fn verify_sig(&self, sig: &[u8], key: &PublicKey, sighash: [u8; 32]) -> Result<(), ()> {
        let sig = ecdsa::Signature::from_slice(sig).map_err(|_| ())?;
        self.secp
            .verify_ecdsa(&Message::from_digest(sighash), &sig.signature, key)
            .map_err(|_| ())
    }
}

fn rejected(index: usize, reason: &str) -> SettlementError {
    SettlementError::broadcast_rejected(format!("input {}: {}", index, reason))
}

#[async_trait]
impl ChainBackend for MockChain {
    async fn get_balance(&self, address: &str) -> SettlementResult<Balance> {
        let script = self.script_for(address);
        let state = self.state();
        if state.offline {
            return Err(SettlementError::network("indexer offline"));
        }
        let mut balance = Balance::default();
        for (output, confirmations) in state.utxos.values().filter(|(o, _)| o.script_pubkey == script) {
            if *confirmations > 0 {
                balance.confirmed_sats += output.value.to_sat();
            } else {
                balance.unconfirmed_sats += output.value.to_sat();
            }
        }
        Ok(balance)
    }

    async fn get_utxos(&self, address: &str) -> SettlementResult<Vec<Utxo>> {
        let script = self.script_for(address);
        let state = self.state();
        if state.offline {
            return Err(SettlementError::network("indexer offline"));
        }
        Ok(state
            .utxos
            .iter()
            .filter(|(_, (o, _))| o.script_pubkey == script)
            .map(|(outpoint, (output, confirmations))| Utxo {
                txid: outpoint.txid.to_string(),
                vout: outpoint.vout,
                value_sats: output.value.to_sat(),
                script_pubkey: output.script_pubkey.clone(),
                confirmations: *confirmations,
            })
            .collect())
    }

    async fn broadcast(&self, tx_hex: &str) -> SettlementResult<String> {
        let bytes = hex::decode(tx_hex).map_err(|_| SettlementError::broadcast_rejected("tx is not hex"))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| SettlementError::broadcast_rejected(format!("undecodable tx: {}", e)))?;

        let mut state = self.state();
        if state.offline {
            return Err(SettlementError::network("broadcaster offline"));
        }
        if state.reject_broadcasts > 0 {
            state.reject_broadcasts -= 1;
            return Err(SettlementError::broadcast_rejected("mempool rejected transaction"));
        }

        let mut prevouts = Vec::with_capacity(tx.input.len());
        for (index, input) in tx.input.iter().enumerate() {
            let (output, _) = state
                .utxos
                .get(&input.previous_output)
                .ok_or_else(|| rejected(index, "missing or already spent"))?;
            prevouts.push(output.clone());
        }
        self.verify_inputs(&tx, &prevouts)?;

        let spent: u64 = prevouts.iter().map(|o| o.value.to_sat()).sum();
        let created: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        if created > spent {
            return Err(SettlementError::broadcast_rejected("outputs exceed inputs"));
        }

        let txid = tx.compute_txid();
        for input in &tx.input {
            state.utxos.remove(&input.previous_output);
        }
        for (vout, output) in tx.output.iter().enumerate() {
            state
                .utxos
                .insert(OutPoint::new(txid, vout as u32), (output.clone(), 0));
        }
        state.broadcasts.push(tx);
        Ok(txid.to_string())
    }

    async fn tip_height(&self) -> SettlementResult<u32> {
        let state = self.state();
        if state.offline {
            return Err(SettlementError::network("indexer offline"));
        }
        Ok(state.tip)
    }
}

struct LightningState {
    connected: bool,
    outbound_sats: u64,
    fail_payments: bool,
    invoices: HashMap<String, u64>,
    paid: Vec<String>,
}

/// Scripted Lightning node
pub struct MockLightning {
    state: Mutex<LightningState>,
}

impl MockLightning {
    pub fn new(connected: bool, outbound_sats: u64) -> Self {
        Self {
            state: Mutex::new(LightningState {
                connected,
                outbound_sats,
                fail_payments: false,
                invoices: HashMap::new(),
                paid: Vec::new(),
            }),
        }
    }

    pub fn set_fail_payments(&self, fail: bool) {
        self.state.lock().unwrap().fail_payments = fail;
    }

    pub fn paid_count(&self) -> usize {
        self.state.lock().unwrap().paid.len()
    }

    pub fn invoice_count(&self) -> usize {
        self.state.lock().unwrap().invoices.len()
    }
}

#[async_trait]
impl LightningClient for MockLightning {
    async fn get_channel_balance(&self) -> SettlementResult<ChannelBalance> {
        let state = self.state.lock().unwrap();
        Ok(ChannelBalance {
            connected: state.connected,
            outbound_sats: state.outbound_sats,
        })
    }

    async fn create_invoice(&self, amount_sats: u64, _memo: &str) -> SettlementResult<String> {
        let invoice = format!("lnbcrt{}n1mock{}", amount_sats, uuid::Uuid::new_v4().simple());
        self.state.lock().unwrap().invoices.insert(invoice.clone(), amount_sats);
        Ok(invoice)
    }

    async fn pay_invoice(&self, payment_request: &str, _timeout: Duration) -> SettlementResult<LightningPayment> {
        let mut state = self.state.lock().unwrap();
        if !state.connected || state.fail_payments {
            return Err(SettlementError::network("no route"));
        }
        let amount = *state
            .invoices
            .get(payment_request)
            .ok_or_else(|| SettlementError::validation("unknown invoice"))?;
        if amount > state.outbound_sats {
            return Err(SettlementError::network("insufficient outbound liquidity"));
        }
        state.outbound_sats -= amount;
        state.paid.push(payment_request.to_string());
        Ok(LightningPayment {
            payment_hash: hex::encode(rand::random::<[u8; 32]>()),
            fee_sats: 1,
        })
    }
}

/// Fully wired engine over mocks, with a manual clock
pub struct Harness {
    pub config: SettlementConfig,
    pub store: Arc<InMemoryStore>,
    pub chain: Arc<MockChain>,
    pub lightning: Arc<MockLightning>,
    pub clock: ManualClock,
    pub events: EventBus,
    pub wallets: Arc<WalletManager>,
    pub queue: Arc<PaymentQueue>,
    pub multisig: Arc<MultisigEscrowManager>,
    pub processor: Arc<PaymentProcessor>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_lightning(MockLightning::new(true, 10_000_000)).await
    }

    pub async fn with_lightning(lightning: MockLightning) -> Self {
        let config = test_config();
        let store = Arc::new(InMemoryStore::new());
        let chain = Arc::new(MockChain::new(config.network));
        let lightning = Arc::new(lightning);
        let clock = ManualClock::new(Utc::now());
        let events = EventBus::default();
        let policy =
            NetworkPolicy::new(config.network).with_arbitrator_selection(ArbitratorSelection::Fixed(0));

        let wallets = Arc::new(
            WalletManager::new(
                config.wallet.clone(),
                policy,
                store.clone(),
                chain.clone(),
                None,
                events.clone(),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );
        let queue = Arc::new(PaymentQueue::new(
            config.queue.clone(),
            config.processor.treasury_user_id.clone(),
            store.clone(),
            wallets.clone(),
            events.clone(),
            Arc::new(clock.clone()),
        ));
        let multisig = Arc::new(
            MultisigEscrowManager::new(
                config.escrow.clone(),
                config.policy.clone(),
                wallets.clone(),
                chain.clone(),
                store.clone(),
                queue.clone(),
                events.clone(),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );
        let processor = Arc::new(PaymentProcessor::new(
            config.processor.clone(),
            config.policy.clone(),
            wallets.clone(),
            Some(lightning.clone()),
            store.clone(),
            queue.clone(),
            events.clone(),
            Arc::new(clock.clone()),
        ));

        wallets
            .create_wallet(&config.processor.treasury_user_id, None)
            .await
            .unwrap();

        Self {
            config,
            store,
            chain,
            lightning,
            clock,
            events,
            wallets,
            queue,
            multisig,
            processor,
        }
    }

    /// Fund the treasury wallet with a confirmed output
    pub async fn fund_treasury(&self, sats: u64) {
        let treasury = self
            .wallets
            .get_wallet(&self.config.processor.treasury_user_id)
            .await
            .unwrap()
            .unwrap();
        self.chain.fund(&treasury.address, sats);
    }
}
