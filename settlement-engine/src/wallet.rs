//! Wallet Manager - per-user HD wallets and single-key spends
//!
//! Each user has one BIP84 P2WPKH address derived at `m/84'/coin'/0'/0/0`.
//! The mnemonic (or imported WIF key) is sealed in the [`SeedVault`] and only
//! opened inside [`WalletManager`] while a transaction is being signed.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use bip39::Mnemonic;
use bitcoin::{
    absolute::LockTime,
    bip32::Xpriv,
    ecdsa,
    hashes::Hash,
    secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, CompressedPublicKey, NetworkKind, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    chain::ChainBackend,
    config::WalletConfig,
    events::{EventBus, SettlementEvent},
    fees::{estimate_fee, FeeEstimate, FeeEstimator, FeeRateSource, InputKind, DUST_THRESHOLD_SATS},
    keystore::SeedVault,
    models::{Balance, BalanceSnapshot, Recipient, SecretKind, SignedTransaction, Utxo, Wallet, WalletInfo},
    network::NetworkPolicy,
    repository::WalletRepository,
    scheduler::Clock,
    SettlementError, SettlementResult,
};

/// Single-key wallets are always derived at this child index
const ACCOUNT_INDEX: u32 = 0;

/// Decrypted signing key; the secret is erased on drop
pub(crate) struct SigningKey {
    secret: SecretKey,
    public: CompressedPublicKey,
}

impl SigningKey {
    pub(crate) fn new(secp: &Secp256k1<All>, secret: SecretKey) -> Self {
        Self {
            public: CompressedPublicKey(secret.public_key(secp)),
            secret,
        }
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        self.public.0
    }

    pub(crate) fn address(&self, policy: &NetworkPolicy) -> Address {
        Address::p2wpkh(&self.public, policy.network())
    }

    /// ECDSA signature over a segwit v0 sighash, SIGHASH_ALL
    pub(crate) fn sign(&self, secp: &Secp256k1<All>, sighash: [u8; 32]) -> ecdsa::Signature {
        let signature = secp.sign_ecdsa(&Message::from_digest(sighash), &self.secret);
        ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        }
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

/// Fresh 12-word phrase with its derived address, not persisted anywhere
#[derive(Debug, Clone)]
pub struct GeneratedWallet {
    pub mnemonic: String,
    pub address: String,
    pub public_key: String,
}

/// Manages user wallets, balances and P2WPKH spends
pub struct WalletManager {
    config: WalletConfig,
    policy: NetworkPolicy,
    repo: Arc<dyn WalletRepository>,
    chain: Arc<dyn ChainBackend>,
    fees: FeeEstimator,
    vault: SeedVault,
    events: EventBus,
    clock: Arc<dyn Clock>,
    secp: Secp256k1<All>,
    /// One spend at a time per wallet so concurrent sends never pick the same UTXOs
    spend_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WalletManager {
    pub fn new(
        config: WalletConfig,
        policy: NetworkPolicy,
        repo: Arc<dyn WalletRepository>,
        chain: Arc<dyn ChainBackend>,
        fee_source: Option<Arc<dyn FeeRateSource>>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> SettlementResult<Self> {
        let vault = SeedVault::new(&config.vault_master_secret, config.kdf_memory_kib, config.kdf_iterations)?;
        info!("Initializing wallet manager on {}", policy.network());

        Ok(Self {
            fees: FeeEstimator::new(fee_source, policy.clone()),
            config,
            policy,
            repo,
            chain,
            vault,
            events,
            clock,
            secp: Secp256k1::new(),
            spend_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn policy(&self) -> &NetworkPolicy {
        &self.policy
    }

    /// Generate a phrase and address without storing anything
    pub fn generate(policy: &NetworkPolicy) -> SettlementResult<GeneratedWallet> {
        let secp = Secp256k1::new();
        let mnemonic = new_mnemonic()?;
        let key = key_from_mnemonic(&secp, policy, &mnemonic.to_string())?;
        Ok(GeneratedWallet {
            mnemonic: mnemonic.to_string(),
            address: key.address(policy).to_string(),
            public_key: hex::encode(key.public_key().serialize()),
        })
    }

    /// Create the user's wallet, or return the existing one unchanged
    pub async fn create_wallet(&self, user_id: &str, mnemonic: Option<&str>) -> SettlementResult<WalletInfo> {
        if user_id.trim().is_empty() {
            return Err(SettlementError::validation("User id cannot be empty"));
        }
        if let Some(existing) = self.repo.get_wallet(user_id).await? {
            debug!("Wallet for {} already exists", user_id);
            return Ok(existing.info());
        }

        let phrase = match mnemonic {
            Some(phrase) => Zeroizing::new(
                Mnemonic::parse(phrase.trim())
                    .map_err(|e| SettlementError::validation(format!("Invalid mnemonic: {}", e)))?
                    .to_string(),
            ),
            None => Zeroizing::new(new_mnemonic()?.to_string()),
        };

        let key = key_from_mnemonic(&self.secp, &self.policy, &phrase)?;
        let sealed = self.vault.seal(user_id, &phrase)?;
        let now = self.clock.now();

        let wallet = Wallet {
            user_id: user_id.to_string(),
            network: self.policy.network(),
            btc_address: key.address(&self.policy).to_string(),
            public_key: Some(hex::encode(key.public_key().serialize())),
            secret_kind: Some(SecretKind::Mnemonic),
            encrypted_secret: Some(sealed),
            derivation_index: ACCOUNT_INDEX,
            balance: Balance::default(),
            balance_synced_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.repo.insert_wallet(wallet.clone()).await {
            // Lost a creation race; the first writer wins
            if let Some(existing) = self.repo.get_wallet(user_id).await? {
                return Ok(existing.info());
            }
            return Err(e);
        }

        info!("Created wallet {} for user {}", wallet.btc_address, user_id);
        Ok(wallet.info())
    }

    /// Register an externally generated address, optionally with its WIF key
    pub async fn import_wallet(
        &self,
        user_id: &str,
        address: &str,
        private_key: Option<&str>,
    ) -> SettlementResult<WalletInfo> {
        let parsed = self.policy.parse_address(address)?;
        if self.repo.get_wallet(user_id).await?.is_some() {
            return Err(SettlementError::validation(format!("User {} already has a wallet", user_id)));
        }

        let now = self.clock.now();
        let mut wallet = Wallet {
            user_id: user_id.to_string(),
            network: self.policy.network(),
            btc_address: parsed.to_string(),
            public_key: None,
            secret_kind: None,
            encrypted_secret: None,
            derivation_index: ACCOUNT_INDEX,
            balance: Balance::default(),
            balance_synced_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Some(wif) = private_key {
            let wif = Zeroizing::new(wif.trim().to_string());
            let key = key_from_wif(&self.secp, &self.policy, &wif)?;
            let derived = key.address(&self.policy);
            if derived != parsed {
                return Err(SettlementError::key_mismatch(format!(
                    "Private key derives {} but {} was supplied",
                    derived, parsed
                )));
            }
            wallet.public_key = Some(hex::encode(key.public_key().serialize()));
            wallet.secret_kind = Some(SecretKind::PrivateKey);
            wallet.encrypted_secret = Some(self.vault.seal(user_id, &wif)?);
        }

        self.repo.insert_wallet(wallet.clone()).await?;
        info!(
            "Imported {} wallet {} for user {}",
            if wallet.is_watch_only() { "watch-only" } else { "spendable" },
            wallet.btc_address,
            user_id
        );
        Ok(wallet.info())
    }

    /// Refresh the balance from the indexer, falling back to the cached value
    pub async fn sync_balance(&self, address: &str) -> SettlementResult<BalanceSnapshot> {
        let parsed = self.policy.parse_address(address)?.to_string();
        let wallet = self.repo.wallet_by_address(&parsed).await?;

        match self.chain.get_balance(&parsed).await {
            Ok(balance) => {
                let now = self.clock.now();
                if let Some(wallet) = &wallet {
                    self.repo.update_balance(&wallet.user_id, balance, now).await?;
                }
                debug!(
                    "Synced {}: {} confirmed, {} unconfirmed",
                    parsed, balance.confirmed_sats, balance.unconfirmed_sats
                );
                Ok(BalanceSnapshot {
                    address: parsed,
                    balance,
                    stale: false,
                    synced_at: Some(now),
                })
            }
            Err(e) => {
                warn!("Balance lookup for {} failed, returning cached value: {}", parsed, e);
                self.events.emit(SettlementEvent::BalanceStale { address: parsed.clone() });
                Ok(BalanceSnapshot {
                    address: parsed,
                    balance: wallet.as_ref().map(|w| w.balance).unwrap_or_default(),
                    stale: true,
                    synced_at: wallet.and_then(|w| w.balance_synced_at),
                })
            }
        }
    }

    /// Build and sign a P2WPKH spend without broadcasting it
    pub async fn create_transaction(
        &self,
        user_id: &str,
        recipients: &[Recipient],
        fee_rate: Option<u64>,
    ) -> SettlementResult<SignedTransaction> {
        if recipients.is_empty() {
            return Err(SettlementError::validation("At least one recipient is required"));
        }
        let mut outputs = Vec::with_capacity(recipients.len() + 1);
        for recipient in recipients {
            if recipient.amount_sats < DUST_THRESHOLD_SATS {
                return Err(SettlementError::validation(format!(
                    "Output of {} sats to {} is below the dust threshold",
                    recipient.amount_sats, recipient.address
                )));
            }
            outputs.push(TxOut {
                value: Amount::from_sat(recipient.amount_sats),
                script_pubkey: self.policy.parse_address(&recipient.address)?.script_pubkey(),
            });
        }
        let target: u64 = recipients.iter().map(|r| r.amount_sats).sum();

        let wallet = self.require_wallet(user_id).await?;
        if wallet.is_watch_only() {
            return Err(SettlementError::validation(format!(
                "Wallet {} is watch-only and cannot sign",
                wallet.btc_address
            )));
        }
        let own_script = self.policy.parse_address(&wallet.btc_address)?.script_pubkey();
        let rate = self.fees.resolve_rate(fee_rate, self.config.fee_target_blocks).await;

        let utxos = self.chain.get_utxos(&wallet.btc_address).await?;
        let selection = select_coins(utxos, target, recipients.len(), rate)?;

        if let Some(change) = selection.change_sats {
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: own_script.clone(),
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selection
                .inputs
                .iter()
                .map(to_txin)
                .collect::<SettlementResult<Vec<_>>>()?,
            output: outputs,
        };

        let key = self.signing_key(&wallet).await?;
        let witnesses = {
            let mut cache = SighashCache::new(&tx);
            let mut witnesses = Vec::with_capacity(selection.inputs.len());
            for (index, utxo) in selection.inputs.iter().enumerate() {
                if utxo.script_pubkey != own_script {
                    return Err(SettlementError::internal(format!(
                        "UTXO {}:{} is not locked to {}",
                        utxo.txid, utxo.vout, wallet.btc_address
                    )));
                }
                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &utxo.script_pubkey,
                        Amount::from_sat(utxo.value_sats),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| SettlementError::crypto(format!("Sighash failed: {}", e)))?;
                let signature = key.sign(&self.secp, sighash.to_byte_array());
                witnesses.push(Witness::p2wpkh(&signature, &key.public_key()));
            }
            witnesses
        };
        drop(key);

        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        let signed = SignedTransaction {
            txid: tx.compute_txid().to_string(),
            tx_hex: bitcoin::consensus::encode::serialize_hex(&tx),
            fee_sats: selection.fee_sats,
            input_count: selection.inputs.len(),
            change_sats: selection.change_sats,
            vsize: tx.vsize(),
        };
        debug!(
            "Built tx {} for {}: {} inputs, fee {} sats",
            signed.txid, user_id, signed.input_count, signed.fee_sats
        );
        Ok(signed)
    }

    /// Submit a signed transaction
    pub async fn broadcast_transaction(&self, tx_hex: &str) -> SettlementResult<String> {
        let txid = self.chain.broadcast(tx_hex).await?;
        info!("Broadcast transaction {}", txid);
        Ok(txid)
    }

    /// Build, sign and broadcast in one step
    pub async fn send(
        &self,
        user_id: &str,
        recipients: &[Recipient],
        fee_rate: Option<u64>,
    ) -> SettlementResult<SignedTransaction> {
        let lock = self.spend_lock(user_id).await;
        let _guard = lock.lock().await;

        let signed = self.create_transaction(user_id, recipients, fee_rate).await?;
        let txid = self.broadcast_transaction(&signed.tx_hex).await?;
        if txid != signed.txid {
            warn!("Broadcaster reported txid {} for {}", txid, signed.txid);
        }
        Ok(signed)
    }

    /// Fee quote for a transaction shape
    pub async fn estimate_fee(
        &self,
        kind: InputKind,
        inputs: usize,
        outputs: usize,
        fee_rate: Option<u64>,
    ) -> FeeEstimate {
        let rate = self.fees.resolve_rate(fee_rate, self.config.fee_target_blocks).await;
        FeeEstimate::new(kind, inputs, outputs, rate)
    }

    /// Current sat/vB for the configured confirmation target
    pub async fn fee_rate(&self) -> u64 {
        self.fees.recommended_rate(self.config.fee_target_blocks).await
    }

    pub async fn get_wallet(&self, user_id: &str) -> SettlementResult<Option<WalletInfo>> {
        Ok(self.repo.get_wallet(user_id).await?.map(|w| w.info()))
    }

    pub async fn user_for_address(&self, address: &str) -> SettlementResult<Option<String>> {
        Ok(self.repo.wallet_by_address(address).await?.map(|w| w.user_id))
    }

    /// Public key of a managed address; watch-only addresses have none
    pub async fn public_key_for_address(&self, address: &str) -> SettlementResult<PublicKey> {
        let wallet = self
            .repo
            .wallet_by_address(address)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("No managed wallet for address {}", address)))?;
        let hex_key = wallet
            .public_key
            .ok_or_else(|| SettlementError::validation(format!("Wallet {} has no public key", address)))?;
        PublicKey::from_str(&hex_key).map_err(SettlementError::from)
    }

    /// Decrypt the signing key behind a managed address
    pub(crate) async fn signing_key_for_address(&self, address: &str) -> SettlementResult<SigningKey> {
        let wallet = self
            .repo
            .wallet_by_address(address)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("No managed wallet for address {}", address)))?;
        self.signing_key(&wallet).await
    }

    async fn signing_key(&self, wallet: &Wallet) -> SettlementResult<SigningKey> {
        let sealed = wallet.encrypted_secret.as_ref().ok_or_else(|| {
            SettlementError::validation(format!("Wallet {} is watch-only and cannot sign", wallet.btc_address))
        })?;
        let secret = self.vault.open(&wallet.user_id, sealed)?;

        let key = match wallet.secret_kind {
            Some(SecretKind::Mnemonic) => key_from_mnemonic(&self.secp, &self.policy, &secret)?,
            Some(SecretKind::PrivateKey) => key_from_wif(&self.secp, &self.policy, &secret)?,
            None => return Err(SettlementError::internal("Sealed secret without a kind")),
        };

        if key.address(&self.policy).to_string() != wallet.btc_address {
            return Err(SettlementError::key_mismatch(format!(
                "Stored key does not match address {}",
                wallet.btc_address
            )));
        }
        Ok(key)
    }

    async fn require_wallet(&self, user_id: &str) -> SettlementResult<Wallet> {
        self.repo
            .get_wallet(user_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("Wallet for {} not found", user_id)))
    }

    /// Per-wallet spend lock; entries nobody holds or waits on are dropped
    async fn spend_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.spend_locks.lock().await;
        locks.retain(|id, lock| id == user_id || Arc::strong_count(lock) > 1);
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Inputs chosen for a spend
#[derive(Debug)]
pub(crate) struct CoinSelection {
    pub inputs: Vec<Utxo>,
    pub fee_sats: u64,
    pub change_sats: Option<u64>,
}

/// Greedy selection: confirmed before unconfirmed, largest first
pub(crate) fn select_coins(
    mut utxos: Vec<Utxo>,
    target_sats: u64,
    recipient_count: usize,
    fee_rate: u64,
) -> SettlementResult<CoinSelection> {
    utxos.sort_by(|a, b| {
        (b.confirmations > 0)
            .cmp(&(a.confirmations > 0))
            .then(b.value_sats.cmp(&a.value_sats))
    });
    let available: u64 = utxos.iter().map(|u| u.value_sats).sum();

    let mut inputs = Vec::new();
    let mut total = 0u64;
    for utxo in utxos {
        total += utxo.value_sats;
        inputs.push(utxo);
        if total >= target_sats + estimate_fee(InputKind::P2wpkh, inputs.len(), recipient_count, fee_rate) {
            break;
        }
    }

    let fee_without_change = estimate_fee(InputKind::P2wpkh, inputs.len().max(1), recipient_count, fee_rate);
    if total < target_sats + fee_without_change {
        return Err(SettlementError::insufficient_funds(target_sats + fee_without_change, available));
    }

    let fee_with_change = estimate_fee(InputKind::P2wpkh, inputs.len(), recipient_count + 1, fee_rate);
    match total.checked_sub(target_sats + fee_with_change) {
        Some(change) if change >= DUST_THRESHOLD_SATS => Ok(CoinSelection {
            inputs,
            fee_sats: fee_with_change,
            change_sats: Some(change),
        }),
        // Dust change folds into the fee
        _ => Ok(CoinSelection {
            fee_sats: total - target_sats,
            inputs,
            change_sats: None,
        }),
    }
}

pub(crate) fn to_txin(utxo: &Utxo) -> SettlementResult<TxIn> {
    let txid = Txid::from_str(&utxo.txid)
        .map_err(|e| SettlementError::validation(format!("Invalid txid {}: {}", utxo.txid, e)))?;
    Ok(TxIn {
        previous_output: OutPoint::new(txid, utxo.vout),
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    })
}

fn new_mnemonic() -> SettlementResult<Mnemonic> {
    let mut entropy = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut entropy[..]);
    Mnemonic::from_entropy(&entropy[..])
        .map_err(|e| SettlementError::crypto(format!("Failed to generate mnemonic: {}", e)))
}

fn key_from_mnemonic(secp: &Secp256k1<All>, policy: &NetworkPolicy, phrase: &str) -> SettlementResult<SigningKey> {
    let mnemonic =
        Mnemonic::parse(phrase).map_err(|e| SettlementError::validation(format!("Invalid mnemonic: {}", e)))?;
    let seed = Zeroizing::new(mnemonic.to_seed(""));
    let master = Xpriv::new_master(policy.network(), &seed[..])?;
    let child = master.derive_priv(secp, &policy.derivation_path(ACCOUNT_INDEX)?)?;
    Ok(SigningKey::new(secp, child.private_key))
}

fn key_from_wif(secp: &Secp256k1<All>, policy: &NetworkPolicy, wif: &str) -> SettlementResult<SigningKey> {
    let key = PrivateKey::from_wif(wif)
        .map_err(|e| SettlementError::validation(format!("Invalid WIF private key: {}", e)))?;
    if key.network != NetworkKind::from(policy.network()) {
        return Err(SettlementError::validation(format!(
            "Private key is not valid for network {}",
            policy.network()
        )));
    }
    if !key.compressed {
        return Err(SettlementError::validation("Uncompressed keys cannot own P2WPKH addresses"));
    }
    Ok(SigningKey::new(secp, key.inner))
}
