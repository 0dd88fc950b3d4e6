//! Entry point: load configuration, wire the chain client, decoder,
//! checkpoint store, transaction-builder stack and API server, then run
//! the ingestion pipeline and API concurrently until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use factoryscope::api::{self, ApiContext};
use factoryscope::blockchain::{ChainClient, EthersChainClient};
use factoryscope::checkpoint::CheckpointStore;
use factoryscope::config::Config;
use factoryscope::decoder::Decoder;
use factoryscope::errors::AppError;
use factoryscope::ingest;
use factoryscope::keys::KeysManager;
use factoryscope::trade::TradeService;
use factoryscope::txbuilder::{
    gwei_to_wei, AutoBuilder, Builder, FeeOracle, FeeOracleConfig, NonceManager,
};

#[derive(Parser, Debug)]
#[command(name = "factoryscope", about = "Factory ingestion pipeline and pair trading service")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("ethers_providers=warn".parse().expect("static directive"))
        .add_directive("hyper=warn".parse().expect("static directive"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = Arc::new(Config::load(&cli.config)?);
    info!(
        chain = %cfg.chain,
        chain_id = cfg.chain_id,
        factory = %cfg.factory_address,
        "configuration loaded"
    );

    let client: Arc<dyn ChainClient> = Arc::new(EthersChainClient::connect(
        &cfg.rpc.http,
        cfg.performance.request_timeout.get(),
    )?);
    let decoder = Arc::new(Decoder::new(&cfg.decoding)?);
    let store = Arc::new(CheckpointStore::new(&cfg.checkpoint.path));
    let last = store.load().map_err(|e| AppError::Other(e.to_string()))?;
    info!(checkpoint = last, "checkpoint loaded");

    let passphrase = std::env::var(&cfg.keystore.passphrase_env).unwrap_or_default();
    let keys = Arc::new(KeysManager::new(&cfg.keystore.dir, passphrase)?);

    let builder = Builder::new(
        cfg.chain_id,
        std::time::Duration::from_secs(cfg.tx.default_deadline_seconds),
    );
    let oracle = Arc::new(FeeOracle::new(
        client.clone(),
        FeeOracleConfig {
            refresh_interval: std::time::Duration::from_secs(cfg.tx.fee_refresh_seconds),
            max_fee_multiplier: cfg.tx.max_fee_multiplier,
            min_priority_fee_wei: gwei_to_wei(cfg.tx.min_priority_fee_gwei)
                .map_err(|e| AppError::Other(e.to_string()))?,
        },
    ));
    let nonce = Arc::new(NonceManager::new(client.clone()));
    let auto = Arc::new(AutoBuilder::new(
        builder,
        client.clone(),
        oracle.clone(),
        nonce,
        cfg.tx.gas_limit_multiplier,
    ));
    let trade = Arc::new(TradeService::new(auto, client.clone(), keys.clone()));
    let ctx = Arc::new(ApiContext {
        cfg: cfg.clone(),
        keys,
        trade,
        client: client.clone(),
    });

    let cancel = CancellationToken::new();
    tokio::spawn(oracle.run(cancel.child_token()));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let result = tokio::try_join!(
        async {
            let out = ingest::run_pipeline(
                cfg.clone(),
                client.clone(),
                decoder,
                store,
                cancel.child_token(),
            )
            .await;
            if out.is_err() {
                cancel.cancel();
            }
            out.map_err(AppError::from)
        },
        async {
            let out = api::run_api(ctx, cancel.child_token()).await;
            if out.is_err() {
                cancel.cancel();
            }
            out
        },
    );

    match result {
        Ok(_) => {
            info!("shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "service failed");
            Err(e)
        }
    }
}
