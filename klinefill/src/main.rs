mod config;

use std::{env, process, sync::Arc};

use config::{AppConfig, CliArgs, ConfigError, USAGE};
use data_client::{BinanceClient, SourceError};
use kline_backfill_engine::{
    spawn_interrupt_listener, BackfillError, BackfillMetrics, KlineBackfillEngine,
    ShutdownCoordinator,
};
use log::{info, warn};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        eprintln!("klinefill failed: {err}");
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // also installs the log -> tracing bridge for the library crates
    if let Err(err) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("klinefill: logging disabled: {err}");
    }
}

async fn run() -> Result<(), AppError> {
    let args = CliArgs::parse(env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }
    let config = AppConfig::load(&args)?;
    let backfill = config.backfill_config()?;
    let client = BinanceClient::new(config.client_config())?;

    info!("begin download kline");
    info!(
        "[{}] {} {} from {} into {} ({:?} layout, {} timestamps)",
        backfill.label,
        config.settings.exchange,
        backfill.pair,
        config.settings.start_time,
        backfill.output_dir.display(),
        backfill.layout,
        String::from(backfill.timezone)
    );

    let metrics = Arc::new(BackfillMetrics::new());
    let coordinator = Arc::new(ShutdownCoordinator::new(backfill.label.clone()));
    let listener = spawn_interrupt_listener(Arc::clone(&coordinator));
    let engine = KlineBackfillEngine::new(backfill, client, coordinator, Arc::clone(&metrics));

    let outcome = engine.run().await;
    if let Err(err) = listener.await {
        warn!("interrupt listener ended abnormally: {err}");
    }
    info!("{}", metrics.snapshot());
    let report = outcome?;
    for partition in &report.partitions {
        info!("{} rows -> {}", partition.rows, partition.path.display());
    }
    info!(
        "stopped ({:?}); resume from {}",
        report.reason, report.cursor_ms
    );
    info!("end");
    Ok(())
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build kline client: {0}")]
    Client(#[from] SourceError),
    #[error(transparent)]
    Backfill(#[from] BackfillError),
}
