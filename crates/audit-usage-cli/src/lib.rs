//! Command surface for the `audit-usage` binary.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`init_tracing`] installs the
//! stderr log subscriber. Both are usable from host programs that embed the
//! extraction without spawning the binary.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use audit_usage_core::{BucketDuration, UsageConfig, UsageRecord};
use audit_usage_pipeline::{
    load_known_resources, run_usage_extraction, run_with_store, AggregationEngine,
    JsonLinesSink, JsonLinesSource, QueryCollisions, RunReport, UsageSink,
};
use audit_usage_store_sqlite::{EventStore, StoreStats};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "audit-usage")]
#[command(about = "Warehouse audit-log usage extraction")]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest events, then emit operation and usage records.
    Run(RunArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Inspect a store kept with `run --keep-store`.
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// JSON-lines event file, or `-` for stdin.
    #[arg(long)]
    events: PathBuf,
    #[arg(long)]
    known_resources: PathBuf,
    /// Destination for JSON-lines usage and operation records.
    #[arg(long)]
    output: PathBuf,
    /// Persist the event store at this path instead of a temporary directory.
    #[arg(long)]
    keep_store: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate a config file and print it with defaults filled in.
    Check(ConfigCheckArgs),
}

#[derive(Debug, Args)]
pub struct ConfigCheckArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    Stats(StoreStatsArgs),
    /// Aggregate usage records from a kept store, using its recorded bucket width.
    Usage(StoreUsageArgs),
}

#[derive(Debug, Args)]
pub struct StoreStatsArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct StoreUsageArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long, default_value_t = audit_usage_core::DEFAULT_TOP_N_QUERIES)]
    top_n: usize,
}

/// Installs a stderr subscriber filtered by `RUST_LOG` (default `warn`).
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr).with_target(true))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(io::stderr).with_target(false))
            .try_init(),
    }
    .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes a parsed command.
///
/// # Errors
/// Returns an error when inputs cannot be read, the config is invalid, or the
/// extraction run fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let report = run_extraction(&args)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Config { command } => match command {
            ConfigCommand::Check(args) => {
                let config = load_config(&args.config)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        },
        Command::Store { command } => run_store(command),
    }
}

fn run_extraction(args: &RunArgs) -> Result<RunReport> {
    let config = load_config(&args.config)?;
    if let Some(path) = args.keep_store.as_deref().filter(|path| path.exists()) {
        return Err(anyhow!(
            "refusing to reuse existing store {}; remove it first",
            path.display()
        ));
    }

    let known_file = File::open(&args.known_resources).with_context(|| {
        format!(
            "failed to open known resources file {}",
            args.known_resources.display()
        )
    })?;
    let known_resources = load_known_resources(BufReader::new(known_file))?;

    let events: Box<dyn BufRead> = if args.events.as_os_str() == "-" {
        Box::new(io::stdin().lock())
    } else {
        let file = File::open(&args.events)
            .with_context(|| format!("failed to open events file {}", args.events.display()))?;
        Box::new(BufReader::new(file))
    };

    let output = File::create(&args.output)
        .with_context(|| format!("failed to create output file {}", args.output.display()))?;
    let mut sink = JsonLinesSink::new(BufWriter::new(output));

    info!(
        known_resources = known_resources.len(),
        output = %args.output.display(),
        "starting usage extraction"
    );

    let report = match &args.keep_store {
        Some(path) => {
            let store = EventStore::open(path, &config.store, config.bucket_duration)
                .context("failed to open event store")?;
            run_with_store(
                &config,
                &known_resources,
                store,
                JsonLinesSource::new(events),
                &mut sink,
            )?
        }
        None => run_usage_extraction(
            &config,
            &known_resources,
            JsonLinesSource::new(events),
            &mut sink,
        )?,
    };

    sink.flush()?;
    Ok(report)
}

fn run_store(command: StoreCommand) -> Result<()> {
    match command {
        StoreCommand::Stats(args) => {
            let mut store = open_kept_store(&args.db)?;
            let stats = store.stats()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_store_stats(&args.db, store.bucket_duration(), &stats);
            }
            store.close()
        }
        StoreCommand::Usage(args) => {
            let mut store = open_kept_store(&args.db)?;
            let bucket_duration = store.bucket_duration();
            let collisions = QueryCollisions::default();
            let engine = AggregationEngine::new(&collisions, args.top_n);
            let stdout = io::stdout();
            let mut sink = JsonLinesSink::new(stdout.lock());
            engine.run(&mut store, |statistic| {
                sink.emit_usage(&UsageRecord::from_statistic(statistic, bucket_duration))
            })?;
            sink.flush()?;
            store.close()
        }
    }
}

fn open_kept_store(path: &Path) -> Result<EventStore> {
    if !path.exists() {
        return Err(anyhow!("store {} does not exist", path.display()));
    }
    EventStore::open_read_only(path)
}

fn load_config(path: &Path) -> Result<UsageConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    UsageConfig::from_json(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

fn print_store_stats(path: &Path, bucket_duration: BucketDuration, stats: &StoreStats) {
    println!("store={} bucket_duration={}", path.display(), bucket_duration.as_str());
    println!(
        "read_events={} query_events={} read_queries={} column_accesses={}",
        stats.read_events, stats.query_events, stats.read_queries, stats.column_accesses
    );
    println!(
        "query_texts={} collision_texts={} buckets={}",
        stats.query_texts, stats.collision_texts, stats.buckets
    );
}
