use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use settlement_engine::{
    amount::sats_to_btc,
    chain::EsploraClient,
    config::SettlementConfig,
    fees::{FeeEstimate, FeeEstimator, FeeRateSource, InputKind},
    lightning::LdkLightningClient,
    network::NetworkPolicy,
    repository::InMemoryStore,
    wallet::WalletManager,
    NodeBackends, SettlementNode,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Consultation settlement engine")]
struct Cli {
    /// TOML configuration file; SETTLEMENT__* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the engine and its background jobs until Ctrl-C
    Run {
        /// Start without a Lightning node (on-chain settlement only)
        #[arg(long, default_value_t = false)]
        no_lightning: bool,
        /// LDK data directory
        #[arg(long, default_value = "./ldk-data")]
        ldk_dir: String,
    },
    /// Quote a network fee for a transaction shape
    EstimateFee {
        #[arg(long, default_value_t = 1)]
        inputs: usize,
        #[arg(long, default_value_t = 2)]
        outputs: usize,
        /// Spend from a 2-of-3 escrow instead of a single-key wallet
        #[arg(long, default_value_t = false)]
        multisig: bool,
        /// sat/vB; asks the indexer when omitted
        #[arg(long)]
        fee_rate: Option<u64>,
    },
    /// Check that an address belongs to the configured network
    CheckAddress { address: String },
    /// Print a fresh mnemonic and its address (not stored)
    NewWallet,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let path = cli.config.as_deref();
    let config = SettlementConfig::read(path)
        .with_context(|| format!("failed to read configuration from {}", path.unwrap_or("environment")))?;

    match cli.cmd {
        Cmd::Run { no_lightning, ldk_dir } => {
            config.validate().context("invalid configuration")?;
            run(config, no_lightning, ldk_dir).await
        }
        Cmd::EstimateFee {
            inputs,
            outputs,
            multisig,
            fee_rate,
        } => {
            let chain: Arc<dyn FeeRateSource> =
                Arc::new(EsploraClient::new(&config.chain).context("failed to build Esplora client")?);
            let estimator = FeeEstimator::new(Some(chain), NetworkPolicy::new(config.network));
            let kind = if multisig {
                InputKind::P2wshMultisig
            } else {
                InputKind::P2wpkh
            };
            let rate = estimator.resolve_rate(fee_rate, config.wallet.fee_target_blocks).await;
            let estimate = FeeEstimate::new(kind, inputs, outputs, rate);
            println!(
                "{} vB at {} sat/vB = {} sats ({} BTC)",
                estimate.vsize,
                estimate.fee_rate,
                estimate.fee_sats,
                sats_to_btc(estimate.fee_sats)
            );
            Ok(())
        }
        Cmd::CheckAddress { address } => {
            let policy = NetworkPolicy::new(config.network);
            match policy.parse_address(&address) {
                Ok(parsed) => {
                    println!("{} is a valid {} address", parsed, config.network);
                    Ok(())
                }
                Err(e) => Err(anyhow!("{}", e)),
            }
        }
        Cmd::NewWallet => {
            let generated = WalletManager::generate(&NetworkPolicy::new(config.network))?;
            println!("address:    {}", generated.address);
            println!("public key: {}", generated.public_key);
            println!("mnemonic:   {}", generated.mnemonic);
            warn!("The mnemonic above is not stored anywhere; use it for testing only");
            Ok(())
        }
    }
}

async fn run(config: SettlementConfig, no_lightning: bool, ldk_dir: String) -> anyhow::Result<()> {
    let chain = Arc::new(EsploraClient::new(&config.chain).context("failed to build Esplora client")?);
    let mut backends = NodeBackends::new(chain.clone()).with_fee_source(chain);

    let ldk = if no_lightning {
        None
    } else {
        let mut builder = ldk_node::Builder::new();
        builder.set_network(config.network);
        builder.set_chain_source_esplora(config.chain.esplora_url.clone(), None);
        builder.set_storage_dir_path(ldk_dir);
        let node = Arc::new(builder.build().context("failed to build LDK node")?);
        node.start().context("failed to start LDK node")?;
        info!("LDK node {} started", node.node_id());
        backends = backends.with_lightning(Arc::new(LdkLightningClient::new(node.clone())));
        Some(node)
    };

    let node = SettlementNode::new(config, Arc::new(InMemoryStore::new()), backends)
        .await
        .context("failed to start settlement node")?;

    let health = node.health_check().await?;
    if health.healthy {
        info!("Node healthy, chain tip {:?}", health.chain_tip);
    } else {
        warn!("Starting with issues: {}", health.issues.join("; "));
    }

    let mut events = node.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            info!("event {} at {}", envelope.event.name(), envelope.emitted_at);
        }
    });

    node.start().await;
    info!("Settlement engine running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    node.shutdown().await?;
    event_log.abort();
    if let Some(ldk) = ldk {
        if let Err(e) = ldk.stop() {
            error!("LDK node did not stop cleanly: {}", e);
        }
    }
    Ok(())
}
