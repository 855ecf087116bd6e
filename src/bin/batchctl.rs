//! Batch queue administration CLI tool.
//!
//! `batchctl` lets operators inspect and repair batches directly in the
//! configured store: push and pluck messages, settle or requeue pending jobs,
//! and manage locks and last run times.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use batchq::batch::Batcher;
use batchq::batchctl::{self, GlobalOptions};
use batchq::settings::AppConfig;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "batchctl")]
#[command(about = "Administration CLI for batch queues")]
#[command(version)]
struct Args {
    /// Path to a TOML config file (defaults to a local Redis)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format instead of human-readable lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    fn to_global_options(&self) -> GlobalOptions {
        GlobalOptions { json: self.json }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append messages to a batch
    Push {
        batch: String,
        /// Message payloads, appended in order
        #[arg(required = true)]
        messages: Vec<String>,
        /// Collapse payloads that are already waiting
        #[arg(long)]
        unique: bool,
    },
    /// Remove messages from the head of a batch
    Pluck {
        batch: String,
        #[arg(long, short = 'n', default_value = "100")]
        limit: usize,
    },
    /// Move messages into a pending job that must be acknowledged
    ReliablePluck {
        batch: String,
        #[arg(long, short = 'n', default_value = "100")]
        limit: usize,
    },
    /// Acknowledge a pending job
    Ack {
        batch: String,
        /// Pending job key as printed by reliable-pluck
        job: String,
    },
    /// Return expired pending jobs to their batch
    Requeue {
        batch: String,
        /// Pending jobs older than this many seconds are expired
        #[arg(long, default_value = "3600")]
        ttl_secs: u64,
        #[arg(long)]
        unique: bool,
    },
    /// Show the number of waiting messages
    Size { batch: String },
    /// List known batches
    Batches,
    /// List a batch's pending jobs
    Pending { batch: String },
    /// Delete a batch (pending jobs are kept)
    Delete { batch: String },
    /// Try to take a batch's flush lock
    Lock {
        batch: String,
        #[arg(long, default_value = "1000")]
        ttl_ms: u64,
    },
    /// Show or set a batch's last run time
    LastRun {
        batch: String,
        /// Epoch milliseconds to store before printing
        #[arg(long)]
        set: Option<i64>,
    },
}

async fn run(args: Args) -> anyhow::Result<()> {
    let opts = args.to_global_options();
    let cfg = AppConfig::load(args.config.as_deref())?;
    let batcher = Batcher::open(&cfg).await?;
    let mut stdout = io::stdout();

    match &args.command {
        Command::Push {
            batch,
            messages,
            unique,
        } => batchctl::push(&batcher, &opts, &mut stdout, batch, messages, *unique).await,
        Command::Pluck { batch, limit } => {
            batchctl::pluck(&batcher, &opts, &mut stdout, batch, *limit).await
        }
        Command::ReliablePluck { batch, limit } => {
            batchctl::reliable_pluck(&batcher, &opts, &mut stdout, batch, *limit).await
        }
        Command::Ack { batch, job } => batchctl::ack(&batcher, &opts, &mut stdout, batch, job).await,
        Command::Requeue {
            batch,
            ttl_secs,
            unique,
        } => {
            let ttl = Duration::from_secs(*ttl_secs);
            batchctl::requeue(&batcher, &opts, &mut stdout, batch, *unique, ttl).await
        }
        Command::Size { batch } => batchctl::size(&batcher, &opts, &mut stdout, batch).await,
        Command::Batches => batchctl::batches(&batcher, &opts, &mut stdout).await,
        Command::Pending { batch } => batchctl::pending(&batcher, &opts, &mut stdout, batch).await,
        Command::Delete { batch } => batchctl::delete(&batcher, &opts, &mut stdout, batch).await,
        Command::Lock { batch, ttl_ms } => {
            let ttl = Duration::from_millis(*ttl_ms);
            batchctl::lock(&batcher, &opts, &mut stdout, batch, ttl).await
        }
        Command::LastRun { batch, set } => {
            batchctl::last_run(&batcher, &opts, &mut stdout, batch, *set).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
