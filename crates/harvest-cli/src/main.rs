use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvest_client::{HostThrottle, MetadataExtractor, ReqwestFetcher};
use harvest_core::{
    AppError, ChunkLedger, CircuitBreakerConfig, Fetcher, Pipeline, ResultSink, RetryPolicy,
    RunConfig, RunMode, RunSummary, TracingReporter, WorkSource, resume_point,
};
use harvest_ledger::csv_source::{DEFAULT_CATEGORY_COLUMN, DEFAULT_TARGET_COLUMN};
use harvest_ledger::{
    ChunkEntry, ColumnMapping, CsvResultSink, CsvWorkSource, Database, DatabaseConfig,
    FileChunkLedger, PgWorkSource,
};

const IMPORT_BATCH: u64 = 1000;

#[derive(Parser)]
#[command(name = "harvest", version, about = "Resumable parallel metadata extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every work item not yet in the output, resuming where the
    /// last run stopped
    Run(RunArgs),

    /// Show how far the output is behind the input
    Status(LedgerArgs),

    /// List chunk statuses recorded by chunked-parallel runs
    Chunks(LedgerArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Store {
    /// CSV input and output files
    Csv,
    /// PostgreSQL ledgers (requires DATABASE_URL)
    Postgres,
}

#[derive(Args, Debug)]
struct LedgerArgs {
    /// Where work items and results live
    #[arg(long, value_enum, env = "HARVEST_STORE", default_value_t = Store::Csv)]
    store: Store,

    /// Input CSV. With the postgres store it is imported into the work ledger first
    #[arg(short, long, env = "HARVEST_INPUT")]
    input: Option<PathBuf>,

    /// Output CSV (csv store)
    #[arg(short, long, env = "HARVEST_OUTPUT")]
    output: Option<PathBuf>,

    /// Chunk ledger file (csv store), defaults to `<output>.chunks.json`
    #[arg(long, env = "HARVEST_CHUNK_FILE")]
    chunk_file: Option<PathBuf>,

    /// Ledger name (postgres store)
    #[arg(long, env = "HARVEST_LEDGER", default_value = "default")]
    ledger: String,

    /// Input column holding the platform label
    #[arg(long, env = "HARVEST_CATEGORY_COLUMN", default_value = DEFAULT_CATEGORY_COLUMN)]
    category_column: String,

    /// Input column holding the URL
    #[arg(long, env = "HARVEST_TARGET_COLUMN", default_value = DEFAULT_TARGET_COLUMN)]
    target_column: String,
}

impl LedgerArgs {
    fn mapping(&self) -> ColumnMapping {
        ColumnMapping {
            category: self.category_column.clone(),
            target: self.target_column.clone(),
        }
    }

    fn input(&self) -> Result<&Path, AppError> {
        self.input
            .as_deref()
            .ok_or_else(|| AppError::ConfigError("--input is required with the csv store".into()))
    }

    fn output(&self) -> Result<&Path, AppError> {
        self.output
            .as_deref()
            .ok_or_else(|| AppError::ConfigError("--output is required with the csv store".into()))
    }

    fn chunk_file(&self) -> Result<PathBuf, AppError> {
        match &self.chunk_file {
            Some(path) => Ok(path.clone()),
            None => {
                let mut path = self.output()?.as_os_str().to_owned();
                path.push(".chunks.json");
                Ok(PathBuf::from(path))
            }
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    ledgers: LedgerArgs,

    /// single-stream or chunked-parallel
    #[arg(long, env = "HARVEST_MODE", default_value = "single-stream")]
    mode: RunMode,

    /// Items per chunk in chunked-parallel mode
    #[arg(long, env = "HARVEST_CHUNK_SIZE", default_value_t = 100)]
    chunk_size: u64,

    /// Maximum items in flight
    #[arg(short = 'j', long, env = "HARVEST_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Units queued per lane ahead of the writer
    #[arg(long, env = "HARVEST_PREFETCH", default_value_t = 2)]
    prefetch: usize,

    /// Hard limit per extraction attempt, in seconds
    #[arg(long, env = "HARVEST_TIMEOUT_SECS", default_value_t = 120)]
    timeout_secs: u64,

    /// Pause after each item on a lane, in milliseconds
    #[arg(long, env = "HARVEST_DELAY_MS", default_value_t = 1000)]
    delay_ms: u64,

    /// Retries after the first attempt for transient failures
    #[arg(long, env = "HARVEST_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// First retry delay in milliseconds, doubled per attempt
    #[arg(long, env = "HARVEST_RETRY_BASE_MS", default_value_t = 2000)]
    retry_base_ms: u64,

    /// Minimum spacing between requests to the same host, in milliseconds
    #[arg(long, env = "HARVEST_HOST_INTERVAL_MS", default_value_t = 0)]
    host_interval_ms: u64,

    /// Disable the extractor circuit breaker
    #[arg(long, env = "HARVEST_NO_CIRCUIT_BREAKER")]
    no_circuit_breaker: bool,

    /// Label for log lines and the summary (random if omitted)
    #[arg(long, env = "HARVEST_RUN_ID")]
    run_id: Option<String>,

    /// Render pages in headless Chromium instead of plain HTTP
    #[cfg(feature = "browser")]
    #[arg(long, env = "HARVEST_BROWSER")]
    browser: bool,
}

impl RunArgs {
    fn run_config(&self) -> Result<RunConfig, AppError> {
        let mut config = RunConfig::default()
            .with_mode(self.mode)
            .with_chunk_size(self.chunk_size)
            .with_concurrency(self.concurrency)
            .with_prefetch_factor(self.prefetch)
            .with_per_item_timeout(Duration::from_secs(self.timeout_secs))
            .with_inter_item_delay(Duration::from_millis(self.delay_ms))
            .with_retry(
                RetryPolicy::new(self.max_retries)
                    .with_base_delay(Duration::from_millis(self.retry_base_ms)),
            )
            .with_circuit_breaker(
                (!self.no_circuit_breaker).then(CircuitBreakerConfig::default),
            );
        if let Some(id) = &self.run_id {
            config = config.with_run_id(id.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::from_default_env().add_directive(
        "harvest=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Status(args) => cmd_status(args).await,
        Commands::Chunks(args) => cmd_chunks(args).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

/// 2 configuration, 3 ledger mismatch, 4 result sink failure, 1 anything else.
fn exit_status(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<AppError>() {
        Some(AppError::ConfigError(_)) => 2,
        Some(AppError::ConsistencyError(_)) => 3,
        Some(AppError::SinkWriteFailed { .. }) => 4,
        _ => 1,
    }
}

async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

/// Copy an input CSV into a PostgreSQL work ledger, batch by batch.
async fn import_csv(db: &Database, ledger: &str, input: &Path, mapping: ColumnMapping) -> Result<()> {
    let source = CsvWorkSource::open(input, mapping)
        .await
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let total = source.total().await?;
    let columns = source.columns();

    let mut inserted = 0;
    let mut start = 0;
    while start < total {
        let end = (start + IMPORT_BATCH).min(total);
        let items = source.get_range(start, end).await?;
        inserted += PgWorkSource::import(db.pool(), ledger, &columns, &items).await?;
        start = end;
    }
    tracing::info!(ledger, total, inserted, "Imported {}", input.display());
    Ok(())
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let config = args.run_config()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight items");
            on_signal.cancel();
        }
    });

    let ledgers = &args.ledgers;
    let summary = match ledgers.store {
        Store::Csv => {
            let input = ledgers.input()?;
            let output = ledgers.output()?;
            let source = CsvWorkSource::open(input, ledgers.mapping())
                .await
                .with_context(|| format!("Failed to open input {}", input.display()))?;
            let sink = CsvResultSink::open(output)
                .await
                .with_context(|| format!("Failed to open output {}", output.display()))?;
            let chunks = FileChunkLedger::open(ledgers.chunk_file()?).await?;
            extract(source, sink, chunks, config, &args, cancel).await?
        }
        Store::Postgres => {
            let db = connect_db().await?;
            if let Some(input) = &ledgers.input {
                import_csv(&db, &ledgers.ledger, input, ledgers.mapping()).await?;
            }
            let source = db.work_source(&ledgers.ledger).await?;
            let sink = db.result_sink(&ledgers.ledger);
            let chunks = db.chunk_ledger(&ledgers.ledger);
            extract(source, sink, chunks, config, &args, cancel).await?
        }
    };

    println!("{summary}");
    if summary.interrupted && !summary.is_complete() {
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}

/// Pick the fetcher, then run.
async fn extract<S, K, L>(
    source: S,
    sink: K,
    chunks: L,
    config: RunConfig,
    args: &RunArgs,
    cancel: CancellationToken,
) -> Result<RunSummary, AppError>
where
    S: WorkSource,
    K: ResultSink,
    L: ChunkLedger,
{
    let host_interval = Duration::from_millis(args.host_interval_ms);

    #[cfg(feature = "browser")]
    {
        if args.browser {
            let fetcher =
                harvest_client::BrowserFetcher::with_timeout(config.per_item_timeout).await?;
            return execute(source, sink, chunks, fetcher, host_interval, config, cancel).await;
        }
    }

    let fetcher = ReqwestFetcher::with_timeout(config.per_item_timeout)?;
    execute(source, sink, chunks, fetcher, host_interval, config, cancel).await
}

async fn execute<S, K, L, F>(
    source: S,
    sink: K,
    chunks: L,
    fetcher: F,
    host_interval: Duration,
    config: RunConfig,
    cancel: CancellationToken,
) -> Result<RunSummary, AppError>
where
    S: WorkSource,
    K: ResultSink,
    L: ChunkLedger,
    F: Fetcher,
{
    let extractor = MetadataExtractor::new(HostThrottle::new(fetcher, host_interval));
    Pipeline::new(source, sink, extractor, config)
        .with_chunk_ledger(chunks)
        .run(cancel, &TracingReporter)
        .await
}

async fn cmd_status(args: LedgerArgs) -> Result<ExitCode> {
    let point = match args.store {
        Store::Csv => {
            let source = CsvWorkSource::open(args.input()?, args.mapping()).await?;
            let sink = CsvResultSink::open(args.output()?).await?;
            resume_point(&source, &sink).await?
        }
        Store::Postgres => {
            let db = connect_db().await?;
            let source = db.work_source(&args.ledger).await?;
            let sink = db.result_sink(&args.ledger);
            resume_point(&source, &sink).await?
        }
    };

    println!("Input rows:  {}", point.work_total);
    println!("Output rows: {}", point.start_index);
    println!("Remaining:   {}", point.remaining);
    println!("Complete:    {:.1}%", point.percent_complete());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_chunks(args: LedgerArgs) -> Result<ExitCode> {
    let entries = match args.store {
        Store::Csv => FileChunkLedger::open(args.chunk_file()?).await?.entries(),
        Store::Postgres => connect_db().await?.chunk_ledger(&args.ledger).entries().await?,
    };

    if entries.is_empty() {
        println!("No chunks recorded");
        return Ok(ExitCode::SUCCESS);
    }
    print!("{}", render_chunks(&entries));
    Ok(ExitCode::SUCCESS)
}

fn render_chunks(entries: &[ChunkEntry]) -> String {
    let mut out = format!("{:<20} {:>21} {:<12} {}\n", "CHUNK", "RANGE", "STATUS", "UPDATED");
    for entry in entries {
        out.push_str(&format!(
            "{:<20} {:>21} {:<12} {}\n",
            entry.id,
            format!("{}..{}", entry.start, entry.end),
            entry.status.as_str(),
            entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        ));
    }
    let done = entries
        .iter()
        .filter(|e| e.status == harvest_core::ChunkStatus::Done)
        .count();
    out.push_str(&format!("\n{done}/{} chunks done\n", entries.len()));
    out
}
