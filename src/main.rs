//! OPPWATCH — Opposite-betting collusion detection
//!
//! Entry point. Loads configuration, initialises structured logging,
//! connects the configured backend and then either runs one detection
//! from the command line, serves the control API, or reads/writes the
//! operator config store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use oppwatch::api::{self, routes::ApiState};
use oppwatch::backend::memory::MemoryExecutor;
use oppwatch::backend::sqlite::SqliteExecutor;
use oppwatch::backend::QueryExecutor;
use oppwatch::config::{AppConfig, DetectionSettings};
use oppwatch::engine::normalizer::parse_timestamp_str;
use oppwatch::engine::{CancelFlag, DetectionService};
use oppwatch::storage::{ConfigStore, JsonFileStore};
use oppwatch::types::{SeedRequest, TimeWindow};

#[derive(Parser, Debug)]
#[command(name = "oppwatch")]
#[command(about = "Opposite-betting collusion detection over wagering round data")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one detection and print the report as JSON
    Detect(DetectArgs),
    /// Serve the control API
    Serve(ServeArgs),
    /// Read or write operator overrides in the config store
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Comma separated seed account ids
    #[arg(short, long)]
    accounts: String,

    /// Window start (inclusive), e.g. 2024-03-01 or 2024-03-01T00:00:00Z
    #[arg(long)]
    from: Option<String>,

    /// Window end (exclusive)
    #[arg(long)]
    to: Option<String>,

    /// Read bets from a JSON fixture instead of the configured backend
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Override the wager tolerance for this run
    #[arg(long)]
    tolerance: Option<Decimal>,

    /// Override the round-ratio threshold for this run
    #[arg(long)]
    round_threshold: Option<Decimal>,

    /// Override the wager-ratio threshold for this run
    #[arg(long)]
    wager_threshold: Option<Decimal>,

    /// Print only the suspicious accounts and their matched bets
    #[arg(long)]
    suspicious_only: bool,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on (defaults to `api.port`)
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print a stored value
    Get { key: String },
    /// Store a value (parsed as JSON, falling back to a plain string)
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging();

    let cfg = AppConfig::load(&cli.config)?;
    let mut store = JsonFileStore::open(&cfg.store.path)?;

    match cli.command {
        Commands::Detect(args) => detect(&cfg, &store, args).await,
        Commands::Serve(args) => serve(&cfg, &store, args).await,
        Commands::Config(cmd) => config_command(&mut store, cmd),
    }
}

async fn detect(cfg: &AppConfig, store: &dyn ConfigStore, args: DetectArgs) -> Result<()> {
    let window = TimeWindow::new(
        parse_bound(args.from.as_deref(), "--from")?,
        parse_bound(args.to.as_deref(), "--to")?,
    );
    let request = SeedRequest::from_csv(&args.accounts, window);

    let executor = connect(cfg, args.fixture.as_ref()).await?;
    let service = DetectionService::from_config(executor, cfg, store)?;

    let settings = DetectionSettings {
        tolerance: args.tolerance.unwrap_or(service.settings().tolerance),
        round_threshold: args.round_threshold.unwrap_or(service.settings().round_threshold),
        wager_threshold: args.wager_threshold.unwrap_or(service.settings().wager_threshold),
        ..service.settings().clone()
    };

    let handle = service.start(request, Some(settings))?;
    let cancel: CancelFlag = handle.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, cancelling run");
            cancel.cancel();
        }
    });

    let report = handle.wait().await?;
    info!(summary = %report, "Detection complete");

    let output = if args.suspicious_only {
        serde_json::json!({
            "run_id": report.run_id,
            "outcome": report.outcome,
            "suspicious_accounts": report.suspicious_accounts(),
            "suspicious_bets": report.suspicious_bets(),
        })
    } else {
        serde_json::to_value(&report).context("Failed to serialise report")?
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn serve(cfg: &AppConfig, store: &dyn ConfigStore, args: ServeArgs) -> Result<()> {
    if !cfg.api.enabled && args.port.is_none() {
        warn!("api.enabled is false in config; serving anyway because `serve` was requested");
    }
    let executor = connect(cfg, args.fixture.as_ref()).await?;
    let service = DetectionService::from_config(executor, cfg, store)?;
    let state = Arc::new(ApiState::new(service, cfg.api.max_finished_runs));
    api::serve(state, args.port.unwrap_or(cfg.api.port)).await
}

fn config_command(store: &mut JsonFileStore, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Get { key } => {
            match store.get(&key) {
                Some(value) => println!("{value}"),
                None => println!("{key} is not set"),
            }
            Ok(())
        }
        ConfigCommand::Set { key, value } => {
            let parsed = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
            store.set(&key, parsed)?;
            info!(key = %key, path = %store.path().display(), "Config value stored");
            Ok(())
        }
    }
}

/// The fixture executor when a fixture is given, else the SQL backend.
async fn connect(cfg: &AppConfig, fixture: Option<&PathBuf>) -> Result<Arc<dyn QueryExecutor>> {
    if let Some(path) = fixture {
        return Ok(Arc::new(MemoryExecutor::from_json_file(&cfg.backend.id, path)?));
    }
    let url = AppConfig::resolve_env(&cfg.backend.url_env)?;
    let executor = SqliteExecutor::connect(
        &cfg.backend.id,
        &url,
        cfg.backend.max_connections,
        cfg.backend.query_timeout_secs.map(Duration::from_secs),
    )
    .await?;
    Ok(Arc::new(executor))
}

fn parse_bound(raw: Option<&str>, flag: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp_str(s).with_context(|| format!("Invalid {flag} timestamp: {s}")))
        .transpose()
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("oppwatch=info"));

    let json_logging = std::env::var("OPPWATCH_LOG_JSON").is_ok();

    // logs go to stderr so the JSON report on stdout stays clean
    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
