//! Backup client - command line entry point.

use anyhow::{bail, Context, Result};
use backup_client::daemon::{BackupScheduler, ShutdownCoordinator};
use backup_client::events::SyncEvent;
use backup_client::{utils, Config, SyncEngine};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "backup-client.toml";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: ./backup-client.toml if present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backup now and print the report
    Backup {
        /// Directory to back up (default: first configured source)
        path: Option<PathBuf>,
    },
    /// Run scheduled backups until SIGINT/SIGTERM
    Daemon,
    /// Show the receiver's health and the local configuration
    Status,
    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Ok(Config::from_file(Path::new(DEFAULT_CONFIG_FILE))?)
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    match args.command {
        Command::Backup { path } => backup(&config, path).await,
        Command::Daemon => daemon(config).await,
        Command::Status => status(&config).await,
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn backup(config: &Config, path: Option<PathBuf>) -> Result<()> {
    let source = match path.or_else(|| config.backup.sources.first().cloned()) {
        Some(source) => source,
        None => bail!("no path given and no [backup] sources configured"),
    };
    let engine = SyncEngine::new(config)?;
    let report = engine
        .run(&source)
        .await
        .with_context(|| format!("backup of {} failed", source.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn daemon(config: Config) -> Result<()> {
    if !config.schedule.enabled || config.schedule.times.is_empty() {
        bail!("daemon mode needs [schedule] enabled = true and at least one time");
    }
    if config.backup.sources.is_empty() {
        bail!("daemon mode needs at least one [backup] source");
    }

    tracing::info!(
        "Starting backup-client v{} (client_id: {}, receiver: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.client_id(),
        config.server.url
    );

    let engine = Arc::new(SyncEngine::new(&config)?);
    let shutdown = ShutdownCoordinator::new();

    let mut events = engine.events().subscribe();
    let mut stop_events = shutdown.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SyncEvent::ScanProgress { .. }) => {}
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => tracing::debug!(target: "backup_client::events", "{}", json),
                        Err(e) => tracing::warn!("Unserializable event: {}", e),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Event log skipped {} events", n);
                    }
                    Err(_) => break,
                },
                _ = stop_events.recv() => break,
            }
        }
    });

    let scheduler = BackupScheduler::new(engine.clone(), config.backup.sources.clone()).await?;
    for time in &config.schedule.times {
        scheduler.schedule_daily(time).await?;
    }
    scheduler.start().await?;
    tracing::info!("{} daily runs scheduled", config.schedule.times.len());

    shutdown.wait_for_signal().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    shutdown.drain(SHUTDOWN_GRACE, || engine.is_running()).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), event_log).await;
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let engine = SyncEngine::new(config)?;
    println!("Receiver:   {}", config.server.url);
    match engine.client().health().await {
        Ok(health) => println!("Health:     {}", health),
        Err(e) => println!("Health:     unreachable ({})", e),
    }
    println!("Client id:  {}", config.backup.client_id());
    println!("Workers:    {}", config.backup.parallel_uploads);
    if config.backup.sources.is_empty() {
        println!("Sources:    (none)");
    }
    for source in &config.backup.sources {
        println!("Source:     {}", source.display());
    }
    if config.schedule.enabled {
        println!("Schedule:   {}", config.schedule.times.join(", "));
    } else {
        println!("Schedule:   disabled");
    }
    Ok(())
}

