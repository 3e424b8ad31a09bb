//! feedsync-ingest - ordered archive feed ingestion tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use feedsync_common::logging::{init_logging, LogConfig, LogLevel};
use feedsync_ingest::config::{
    ListingConfig, PipelineConfig, RetryPolicy, StoreConfig, DEFAULT_CONCURRENCY,
    DEFAULT_LISTING_TIMEOUT_SECS, DEFAULT_LISTING_URL, DEFAULT_LIST_KEY,
    DEFAULT_RUN_TIMEOUT_SECS, DEFAULT_WATERMARK_KEY, MAX_ATTEMPTS,
};
use feedsync_ingest::store::{ArchiveStore, MemoryStore, PostgresStore};
use feedsync_ingest::{Pipeline, RunOutcome};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "feedsync-ingest")]
#[command(author, version, about = "Fetch feed archives and commit them in order")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch archives newer than the watermark and commit them
    Run(RunArgs),

    /// Show the current watermark and document count
    Status(StoreArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Listing page to discover archives from
    #[arg(short, long, env = "FEED_URL", default_value = DEFAULT_LISTING_URL)]
    url: String,

    /// Number of parallel downloads
    #[arg(short = 'n', long, env = "MAX_DOWNLOADS", default_value_t = DEFAULT_CONCURRENCY)]
    max_downloads: usize,

    /// Archives allowed in flight or waiting for commit (default: 4 per download)
    #[arg(long, env = "MAX_BACKLOG")]
    max_backlog: Option<usize>,

    /// Deadline for the whole run, in seconds
    #[arg(long, env = "RUN_TIMEOUT_SECS", default_value_t = DEFAULT_RUN_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Timeout for fetching the listing page, in seconds
    #[arg(long, default_value_t = DEFAULT_LISTING_TIMEOUT_SECS)]
    listing_timeout_secs: u64,

    /// Attempts per archive before the run fails
    #[arg(long, default_value_t = MAX_ATTEMPTS)]
    retry_attempts: u32,

    /// Base delay between attempts, in milliseconds (grows linearly)
    #[arg(long, default_value_t = 0)]
    retry_delay_ms: u64,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Where committed documents go
    #[arg(long, value_enum, env = "FEED_STORE", default_value_t = StoreBackend::Postgres)]
    store: StoreBackend,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Name of the document list
    #[arg(long, env = "FEED_LIST_KEY", default_value = DEFAULT_LIST_KEY)]
    list_key: String,

    /// Name of the watermark
    #[arg(long, env = "FEED_WATERMARK_KEY", default_value = DEFAULT_WATERMARK_KEY)]
    watermark_key: String,

    /// Do not apply database migrations on startup
    #[arg(long)]
    skip_migrations: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum StoreBackend {
    Postgres,
    /// Keep everything in memory; nothing persists after the run
    Memory,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("feedsync-ingest")
        .build();

    // Environment variables take precedence over flags
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _log_guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => status(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let listing = ListingConfig {
        url: args.url,
        timeout_secs: args.listing_timeout_secs,
        ..Default::default()
    };
    let config = PipelineConfig {
        concurrency: args.max_downloads,
        max_backlog: args.max_backlog,
        run_timeout_secs: args.timeout_secs,
        retry: RetryPolicy {
            max_attempts: args.retry_attempts,
            delay_ms: args.retry_delay_ms,
        },
    };
    listing.validate()?;
    config.validate()?;

    let store = open_store(&args.store).await?;
    let pipeline = Pipeline::http(&listing, config, store)?.with_progress(args.progress);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run");
                cancel.cancel();
            }
        }
    });

    info!(url = %listing.url, "Starting run");
    match pipeline.run(&cancel).await? {
        RunOutcome::NothingToDo { watermark } => {
            info!(watermark = %watermark, "Already up to date");
        },
        RunOutcome::Completed(report) => {
            info!(
                committed = report.committed,
                documents = report.records,
                peak_backlog = report.peak_backlog,
                "Ingestion complete"
            );
        },
    }

    Ok(())
}

async fn status(args: StoreArgs) -> Result<()> {
    let store = open_store(&args).await?;
    let watermark = store.load_watermark().await?;
    let documents = store.document_count().await?;

    println!("List:      {}", args.list_key);
    println!(
        "Latest:    {}",
        watermark.key.as_deref().unwrap_or("(nothing committed)")
    );
    println!("Revision:  {}", watermark.revision);
    println!("Documents: {}", documents);
    Ok(())
}

async fn open_store(args: &StoreArgs) -> Result<Arc<dyn ArchiveStore>> {
    let config = StoreConfig {
        list_key: args.list_key.clone(),
        watermark_key: args.watermark_key.clone(),
    };
    config.validate()?;

    match args.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing will persist");
            Ok(Arc::new(MemoryStore::new(config)))
        },
        StoreBackend::Postgres => {
            let url = args
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let store = PostgresStore::connect(url, config)
                .await
                .context("Failed to connect to database")?;
            if !args.skip_migrations {
                store.migrate().await.context("Failed to run migrations")?;
            }
            Ok(Arc::new(store))
        },
    }
}
