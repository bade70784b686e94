//! Perfwatch service entry point
//!
//! Runs the background monitor against the configured database and
//! offers maintenance commands for credentials, configuration and
//! recorded history.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use perfwatch_engine::{EngineConfig, LoadKind, PerformanceMonitor, RetentionStore};

const INITIAL_KEY_NAME: &str = "default";

/// Perfwatch command line interface
#[derive(Parser)]
#[command(name = "perfwatch")]
#[command(about = "Self-monitoring telemetry engine with bounded retention")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path, overriding the configuration
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log level, overriding the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Run the background monitor until interrupted
    Start,

    /// Issue a new API key and print it once
    CreateKey {
        #[arg(long)]
        name: String,
    },

    /// Deactivate every API key with the given name
    RevokeKey {
        #[arg(long)]
        name: String,
    },

    /// List API keys without their secrets
    ListKeys,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Health check
    Health,

    /// Print recent error records
    Errors {
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,

        /// Only records with this level (INFO, WARNING, ERROR)
        #[arg(long)]
        level: Option<String>,
    },

    /// Print recent metric records
    History {
        #[arg(short = 'n', long, default_value_t = 100)]
        limit: usize,
    },

    /// Load the host on purpose to exercise threshold breaches
    SimulateLoad {
        /// Seconds to run, at most 10
        #[arg(short, long, default_value_t = 5.0)]
        duration: f64,

        /// Allocate memory instead of burning CPU
        #[arg(long)]
        memory: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = initialize_logging(&cli, &config) {
        eprintln!("Failed to initialize logging: {:#}", e);
        process::exit(1);
    }

    let result = match cli.command {
        Some(Commands::Start) | None => start_service(config).await,
        Some(Commands::CreateKey { name }) => create_key(&config, &name),
        Some(Commands::RevokeKey { name }) => revoke_key(&config, &name),
        Some(Commands::ListKeys) => list_keys(&config),
        Some(Commands::Config { show }) => handle_config(&config, show),
        Some(Commands::Health) => health_check(config),
        Some(Commands::Errors { limit, level }) => show_errors(config, limit, level.as_deref()),
        Some(Commands::History { limit }) => show_history(config, limit),
        Some(Commands::SimulateLoad { duration, memory }) => simulate_load(config, duration, memory),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

/// Initialize logging from the CLI flags, falling back to the `[logging]`
/// section
fn initialize_logging(cli: &Cli, config: &EngineConfig) -> anyhow::Result<()> {
    let requested = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = match requested.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("perfwatch_engine={}", log_level).parse()?)
        .add_directive(format!("perfwatch={}", log_level).parse()?)
        .add_directive("tokio=warn".parse()?)
        .add_directive("mio=warn".parse()?);

    if cli.json_logs || config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Load configuration: explicit file, then the default location, then
/// environment and defaults
fn load_configuration(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| EngineConfig::default_config_path().ok());
    let mut config = EngineConfig::load_with_fallback(path).context("loading configuration")?;

    if let Some(database) = &cli.database {
        config.storage.database_path = database.clone();
    }

    config.validate()?;
    Ok(config)
}

fn open_store(config: &EngineConfig) -> anyhow::Result<RetentionStore> {
    RetentionStore::open(&config.storage.database_path, config.storage.write_retry.clone())
        .with_context(|| format!("opening {}", config.storage.database_path.display()))
}

/// Run the background monitor until SIGINT or SIGTERM
async fn start_service(config: EngineConfig) -> anyhow::Result<()> {
    info!(
        database = %config.storage.database_path.display(),
        max_history_records = config.storage.max_history_records,
        "Starting perfwatch"
    );

    let service = PerformanceMonitor::new(config)?;

    if service.store().list_credentials()?.is_empty() {
        let token = service.store().create_credential(INITIAL_KEY_NAME)?;
        println!("API key created: {}", token);
        println!("Save this key - it will not be shown again.");
    }

    service.start().await?;
    info!("Perfwatch started");

    wait_for_shutdown().await?;

    info!("Initiating graceful shutdown");
    service.shutdown().await?;
    info!("Perfwatch stopped");
    Ok(())
}

fn create_key(config: &EngineConfig, name: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let token = store.create_credential(name)?;
    println!("{}", token);
    Ok(())
}

fn revoke_key(config: &EngineConfig, name: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let revoked = store.revoke_credential(name)?;
    println!("Revoked {} key(s) named {}", revoked, name);
    Ok(())
}

fn list_keys(config: &EngineConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    for key in store.list_credentials()? {
        println!(
            "{:>4}  {:<20} {:<8} created {}  last used {}",
            key.id,
            key.name,
            if key.active { "active" } else { "revoked" },
            key.created_at.to_rfc3339(),
            key.last_used_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}

/// Handle configuration commands
fn handle_config(config: &EngineConfig, show: bool) -> anyhow::Result<()> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        config.validate()?;
        println!("Configuration is valid");
    }
    Ok(())
}

/// Perform health check
fn health_check(config: EngineConfig) -> anyhow::Result<()> {
    let service = PerformanceMonitor::new(config)?;
    let health = service.health();
    let snapshot = service.get_system_metrics();

    println!("{}", serde_json::to_string_pretty(&health)?);
    println!(
        "cpu {:.1}%  memory {:.1}%  disk {:.1}%",
        snapshot.cpu_usage, snapshot.memory_usage, snapshot.disk_usage
    );
    println!(
        "{} metric rows, {} error rows",
        service.store().count_metrics()?,
        service.store().count_errors()?
    );
    Ok(())
}

fn show_errors(config: EngineConfig, limit: usize, level: Option<&str>) -> anyhow::Result<()> {
    let service = PerformanceMonitor::new(config)?;
    let errors = service.get_errors_history(Some(limit), level, None)?;
    println!("{}", serde_json::to_string_pretty(&errors)?);
    Ok(())
}

fn show_history(config: EngineConfig, limit: usize) -> anyhow::Result<()> {
    let service = PerformanceMonitor::new(config)?;
    let metrics = service.get_metrics_history(Some(limit), None)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn simulate_load(config: EngineConfig, duration: f64, memory: bool) -> anyhow::Result<()> {
    let duration = Duration::try_from_secs_f64(duration).context("invalid duration")?;
    let kind = if memory {
        LoadKind::MemoryIntensive
    } else {
        LoadKind::CpuIntensive
    };

    let service = PerformanceMonitor::new(config)?;
    let report = service.simulate_load(duration, kind, None)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Handle shutdown signals
#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, initiating graceful shutdown");
    Ok(())
}
