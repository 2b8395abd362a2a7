use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_appender::rolling;

use crate::{
    events::SyncEvent,
    fullnode::{FullNodeClient, HttpFullNodeClient},
    notify::LogNotifier,
    sync::{CatchupDriver, CatchupSynchronizer},
    wallet_service::HttpWalletServiceClient,
};

/// Vertex Indexer CLI - catches a wallet service up with its fullnode
///
/// Runs one catch-up pass: downloads every block the wallet service is
/// missing, submits the confirmed transactions in dependency order and
/// reports the result. Intended to be invoked periodically or after the
/// streaming daemon detected a gap.
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct CliArgs {
    /// Fullnode API base URL. Example: http://localhost:8080/
    #[clap(long, default_value = "http://localhost:8080/", env = "FULLNODE_URL")]
    fullnode_url: String,

    /// Wallet service API base URL. Example: http://localhost:3000/
    #[clap(long, default_value = "http://localhost:3000/", env = "WALLET_SERVICE_URL")]
    wallet_service_url: String,

    /// Network the fullnode must be running on. The pass refuses to start
    /// against a fullnode reporting any other network.
    #[clap(long, default_value = "mainnet", env = "NETWORK")]
    network: String,

    /// Logging folder path.
    #[clap(long, default_value = "logs")]
    log_folder: String,

    /// Enable verbose logging. This will show more detailed information about
    /// the synchronization process and any errors that occur.
    #[clap(long)]
    verbose: bool,
}

impl CliArgs {
    fn validate(&self) -> Result<(), String> {
        if self.network.is_empty() {
            return Err("network must not be empty".to_string());
        }
        Ok(())
    }
}

/// Relative endpoint joins need the base to end with a slash.
fn normalize_base_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

pub async fn run_cli() -> Result<(), String> {
    // Parse CLI Args
    let args: CliArgs = CliArgs::parse();
    args.validate()?;

    // Setup Logging
    let log_level = if args.verbose { "debug" } else { "info" };
    let (non_blocking, _guard) =
        tracing_appender::non_blocking(rolling::never(&args.log_folder, "dev_logs.log"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(non_blocking)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set up logging subscriber: {e}"))?;

    run(args).await
}

async fn run(args: CliArgs) -> Result<(), String> {
    info!("Running with version: {}", option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"));

    let fullnode = HttpFullNodeClient::new(&normalize_base_url(&args.fullnode_url))
        .map_err(|e| format!("Failed to create fullnode client: {e}"))?;
    let wallet_service = HttpWalletServiceClient::new(&normalize_base_url(&args.wallet_service_url))
        .map_err(|e| format!("Failed to create wallet service client: {e}"))?;

    let network = fullnode
        .get_network()
        .await
        .map_err(|e| format!("Failed to query fullnode network: {e}"))?;
    if network != args.network {
        return Err(format!(
            "Fullnode network {network} does not match configured {expected}",
            expected = args.network
        ));
    }
    info!(%network, "Fullnode network validated");

    let driver = CatchupDriver::new(
        CatchupSynchronizer::new(Arc::new(fullnode), Arc::new(wallet_service)),
        Arc::new(LogNotifier),
        args.network.clone(),
    );
    let terminal = driver
        .run_once()
        .await
        .map_err(|e| format!("Catch-up pass failed: {e}"))?;

    if let Ok(json) = serde_json::to_string(&terminal) {
        println!("{json}");
    }
    match terminal {
        SyncEvent::Finished => Ok(()),
        other => Err(format!("Catch-up pass halted: {other:?}")),
    }
}
