use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use kestrel_client::{HttpFetcher, HttpSessionFactory, MetadataExtractor};
use kestrel_core::job_queue::ChunkJobStore;
use kestrel_core::models::{ScrapeMode, ScrapeOutcome, ScrapeResult};
use kestrel_core::traits::{CacheBackend, Fetcher, SessionFactory};
use kestrel_core::{
    BatchProcessor, BatchReport, DEFAULT_STREAM_BATCH_SIZE, EngineConfig, MemoryJobStore,
    NullCacheBackend, TaskEngine, util,
};
use kestrel_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "kestrel", version, about = "Adaptive page metadata scraper")]
struct Cli {
    /// Render pages in headless Chromium instead of plain HTTP
    #[arg(long, global = true, default_value_t = false)]
    browser: bool,

    /// Use PostgreSQL for the distributed cache and chunk jobs (requires DATABASE_URL)
    #[arg(long, global = true, default_value_t = false)]
    database: bool,

    /// Allow requests to private and loopback addresses
    #[arg(long, global = true, env = "KESTREL_ALLOW_PRIVATE", default_value_t = false)]
    allow_private: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape metadata from a single page
    Scrape {
        #[arg(short, long)]
        url: String,

        /// Extraction depth: simple, full or super
        #[arg(short, long, default_value = "simple")]
        mode: ScrapeMode,
    },

    /// Scrape a URL list and print results as they complete (one JSON per line)
    Stream {
        /// File with one URL per line
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value = "simple")]
        mode: ScrapeMode,

        /// URLs in flight at once (capped by the mode's sub-batch size)
        #[arg(short, long, default_value_t = DEFAULT_STREAM_BATCH_SIZE)]
        batch_size: usize,
    },

    /// Scrape a large URL list in chunks with a worker pool
    Batch {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value = "simple")]
        mode: ScrapeMode,

        /// URLs per chunk (clamped to the configured bounds)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Concurrent chunk workers (clamped to the configured bounds)
        #[arg(long)]
        workers: Option<usize>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// Show a chunk job, or every chunk of a batch (requires DATABASE_URL)
    Job {
        /// Chunk job id
        #[arg(long, conflicts_with = "batch")]
        id: Option<Uuid>,

        /// Batch id
        #[arg(long)]
        batch: Option<Uuid>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kestrel=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Job { id, batch } = cli.command {
        let db = connect_db().await?;
        return cmd_job(&db, id, batch).await;
    }

    let config = EngineConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = if cli.database {
        Some(connect_db().await?)
    } else {
        None
    };
    let extractor = MetadataExtractor::new();

    if cli.browser {
        return run_in_browser(cli.command, config, extractor, db).await;
    }

    let fetcher = if cli.allow_private {
        HttpFetcher::new().allow_private_urls()
    } else {
        HttpFetcher::new()
    };
    let factory = HttpSessionFactory::new();

    match db {
        Some(db) => {
            let engine = TaskEngine::new(config, factory, fetcher, extractor, db.cache_backend());
            run_command(cli.command, engine, db.job_repo()).await
        }
        None => {
            let engine = TaskEngine::new(config, factory, fetcher, extractor, NullCacheBackend);
            run_command(cli.command, engine, MemoryJobStore::new()).await
        }
    }
}

#[cfg(feature = "browser")]
async fn run_in_browser(
    command: Commands,
    config: EngineConfig,
    extractor: MetadataExtractor,
    db: Option<Database>,
) -> Result<()> {
    use kestrel_client::{BrowserFetcher, BrowserSessionFactory};

    let factory = BrowserSessionFactory::launch()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let fetcher = BrowserFetcher::new();

    match db {
        Some(db) => {
            let engine = TaskEngine::new(config, factory, fetcher, extractor, db.cache_backend());
            run_command(command, engine, db.job_repo()).await
        }
        None => {
            let engine = TaskEngine::new(config, factory, fetcher, extractor, NullCacheBackend);
            run_command(command, engine, MemoryJobStore::new()).await
        }
    }
}

#[cfg(not(feature = "browser"))]
async fn run_in_browser(
    _command: Commands,
    _config: EngineConfig,
    _extractor: MetadataExtractor,
    _db: Option<Database>,
) -> Result<()> {
    anyhow::bail!("kestrel was built without the `browser` feature")
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db)
}

async fn run_command<S, F, B, J>(
    command: Commands,
    engine: TaskEngine<S, F, MetadataExtractor, B>,
    store: J,
) -> Result<()>
where
    S: SessionFactory,
    F: Fetcher<S::Session> + 'static,
    B: CacheBackend + 'static,
    J: ChunkJobStore,
{
    let engine = Arc::new(engine);
    let warmed = engine
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    tracing::debug!(sessions = warmed, "Engine initialized");

    let cancel_token = CancellationToken::new();
    let autoscaler = engine.spawn_autoscaler(cancel_token.clone());

    let outcome = match command {
        Commands::Scrape { url, mode } => cmd_scrape(&engine, &url, mode).await,
        Commands::Stream {
            file,
            mode,
            batch_size,
        } => cmd_stream(&engine, &file, mode, batch_size).await,
        Commands::Batch {
            file,
            mode,
            chunk_size,
            workers,
            format,
        } => {
            let processor = BatchProcessor::new(Arc::clone(&engine), store);
            cmd_batch(&processor, &file, mode, chunk_size, workers, format, &cancel_token).await
        }
        Commands::Job { .. } => Err(anyhow::anyhow!("the job command does not run the engine")),
    };

    cancel_token.cancel();
    let _ = autoscaler.await;

    let metrics = engine.metrics();
    for mode in metrics.modes.iter().filter(|m| m.requests > 0) {
        tracing::info!(
            mode = %mode.mode,
            requests = mode.requests,
            succeeded = mode.successes,
            failed = mode.failures,
            cache_hit_ratio = mode.hit_ratio,
            "Session metrics"
        );
    }
    engine.shutdown().await;

    outcome
}

async fn cmd_scrape<S, F, B>(
    engine: &TaskEngine<S, F, MetadataExtractor, B>,
    url: &str,
    mode: ScrapeMode,
) -> Result<()>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    B: CacheBackend,
{
    tracing::info!(url, %mode, "Scraping");
    let result = engine
        .get_metadata(url, mode)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_stream<S, F, B>(
    engine: &TaskEngine<S, F, MetadataExtractor, B>,
    file: &Path,
    mode: ScrapeMode,
    batch_size: usize,
) -> Result<()>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    B: CacheBackend,
{
    let urls = util::load_urls(file).map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(urls = urls.len(), %mode, batch_size, "Streaming");

    let mut results = std::pin::pin!(engine.stream_metadata(urls, mode, batch_size));
    while let Some(result) = results.next().await {
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_batch<S, F, B, J>(
    processor: &BatchProcessor<S, F, MetadataExtractor, B, J>,
    file: &Path,
    mode: ScrapeMode,
    chunk_size: Option<usize>,
    workers: Option<usize>,
    format: OutputFormat,
    cancel_token: &CancellationToken,
) -> Result<()>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    B: CacheBackend,
    J: ChunkJobStore,
{
    let urls = util::load_urls(file).map_err(|e| anyhow::anyhow!(e))?;

    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling chunks that have not started");
            ctrl_c_token.cancel();
        }
    });

    let report = processor
        .process_large_batch(urls, mode, chunk_size, workers, cancel_token)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Csv => write_csv(&report)?,
    }
    Ok(())
}

fn write_csv(report: &BatchReport) -> Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(["url", "mode", "status", "error_kind", "error", "from_cache", "payload"])?;

    for result in report.results() {
        writer.write_record(csv_row(result)?)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_row(result: &ScrapeResult) -> Result<[String; 7]> {
    let (status, kind, error, payload) = match &result.outcome {
        ScrapeOutcome::Success { payload } => (
            "ok",
            String::new(),
            String::new(),
            serde_json::to_string(payload)?,
        ),
        ScrapeOutcome::Failure(failure) => (
            "error",
            failure.kind.as_str().to_string(),
            failure.message.clone(),
            String::new(),
        ),
    };
    Ok([
        result.url.clone(),
        result.mode.to_string(),
        status.to_string(),
        kind,
        error,
        result.from_cache.to_string(),
        payload,
    ])
}

async fn cmd_job(db: &Database, id: Option<Uuid>, batch: Option<Uuid>) -> Result<()> {
    let repo = db.job_repo();

    match (id, batch) {
        (Some(id), _) => {
            let job = repo
                .get_job(id)
                .await
                .map_err(|e| anyhow::anyhow!(e))?
                .with_context(|| format!("No chunk job with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        (None, Some(batch_id)) => {
            let jobs = repo
                .list_batch(batch_id)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            if jobs.is_empty() {
                println!("No chunks found for batch {batch_id}");
                return Ok(());
            }
            println!("Batch {batch_id}:\n");
            for job in &jobs {
                println!(
                    "  [{:>4}] {:<15} {} ok / {} failed of {} (job {})",
                    job.chunk_index,
                    job.status.as_str(),
                    job.succeeded,
                    job.failed,
                    job.urls.len(),
                    job.id,
                );
            }
        }
        (None, None) => {
            let jobs = repo
                .list_recent(None, 20)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            for job in &jobs {
                println!(
                    "  {} batch={} chunk={} {} ({})",
                    job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    job.batch_id,
                    job.chunk_index,
                    job.status,
                    job.mode,
                );
            }
            println!("\nTotal: {} jobs", jobs.len());
        }
    }
    Ok(())
}
