use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info};

use claimdex::daemon::RpcDaemon;
use claimdex::db::ClaimDb;
use claimdex::error::Result;
use claimdex::mempool::MemPool;
use claimdex::metrics;
use claimdex::prefetch::Prefetcher;
use claimdex::processor::BlockProcessor;
use claimdex::search::NullSearchIndex;
use claimdex::settings;
use claimdex::telemetry::{init_tracing, TelemetryConfig};

#[derive(Parser)]
#[command(name = "claimdex", about = "Claim chain indexer")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    settings::init_global_config(&args.config)?;
    let config = settings::get_global_config();
    init_tracing(TelemetryConfig::default())?;
    metrics::register_metrics();

    let db_path = settings::db_path(config)?;
    let reorg_limit = settings::reorg_limit(config);
    let db = ClaimDb::open(Path::new(&db_path), reorg_limit)?;
    info!(
        height = db.state.db_height,
        tx_count = db.state.db_tx_count,
        first_sync = db.state.first_sync,
        "opened claim database"
    );

    let (user, pass) = settings::daemon_auth(config);
    let daemon = RpcDaemon::new(settings::daemon_url(config)?, user, pass);

    let state_lock = Arc::new(Mutex::new(()));
    let shutdown = Arc::new(Notify::new());
    let mempool = MemPool::new(
        daemon.clone(),
        db.raw_handle(),
        state_lock.clone(),
        settings::mempool_refresh_secs(config),
    );
    let prefetcher = Arc::new(Prefetcher::new(
        daemon.clone(),
        settings::prefetch_min_cache_size(config),
        Duration::from_secs(settings::prefetch_polling_delay_secs(config)),
    ));

    let mut processor = BlockProcessor::new(
        db,
        daemon.clone(),
        NullSearchIndex,
        mempool.clone(),
        prefetcher.clone(),
        state_lock,
        shutdown.clone(),
    );
    let start_height = processor.next_height();

    let prefetch_task = {
        let prefetcher = prefetcher.clone();
        tokio::spawn(async move {
            if let Err(e) = prefetcher.main_loop(start_height).await {
                error!("prefetcher failed: {e}");
            }
        })
    };
    let mempool_task = {
        let mempool = mempool.clone();
        tokio::spawn(async move {
            if let Err(e) = mempool.keep_synchronized().await {
                error!("mempool sync failed: {e}");
            }
        })
    };

    let result = tokio::select! {
        r = processor.fetch_and_process_blocks() => r,
        _ = shutdown.notified() => {
            info!("shutdown requested");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down cleanly");
            Ok(())
        }
    };

    prefetch_task.abort();
    mempool_task.abort();
    info!("closing the DB for a clean shutdown...");
    result
}
