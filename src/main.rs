use clap::Parser;
use std::path::PathBuf;

use batchq::{bootstrap, settings, trace};

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Runs the expiry sweeper (and metrics endpoint) for batch queues
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = settings::AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.logging.format)?;

    tracing::info!(
        namespace = %cfg.namespace,
        backend = ?cfg.store.backend,
        "starting batchq"
    );
    let node = bootstrap::start(&cfg).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.shutdown().await;

    Ok(())
}
