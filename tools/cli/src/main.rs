//! Offsync CLI - inspect and drive an offline-first sync queue.
//!
//! This tool captures changes into a persisted pending queue, shows what is
//! waiting, flushes it to a remote and runs a long-lived engine fed with JSON
//! lines on stdin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use offsync_common::TargetId;
use offsync_sync::{PendingQueue, SyncConfig, SyncEngine, SyncOutcome};
use offsync_transport::{create_default_registry, HttpTransport};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offsync - offline-first change delivery")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file.
    Init {
        /// Where to write the configuration.
        #[arg(short, long, default_value = "offsync.json")]
        config: PathBuf,

        /// Remote collection to sync into.
        #[arg(short, long)]
        target: Option<String>,

        /// HTTP endpoint of the remote.
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Capture a change into the pending queue.
    Enqueue {
        /// Queue file (default: platform data directory).
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Change payload as JSON.
        payload: String,
    },

    /// List undelivered changes.
    Pending {
        /// Queue file (default: platform data directory).
        #[arg(short, long)]
        state: Option<PathBuf>,
    },

    /// Show queue information.
    Status {
        /// Queue file (default: platform data directory).
        #[arg(short, long)]
        state: Option<PathBuf>,
    },

    /// Deliver the pending queue to an HTTP endpoint once.
    Flush {
        /// Queue file (default: platform data directory).
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// HTTP endpoint of the remote.
        #[arg(short, long)]
        endpoint: String,

        /// Remote collection to sync into.
        #[arg(short, long)]
        target: String,
    },

    /// Run an engine, reading one JSON change per line from stdin.
    Run {
        /// Configuration file.
        #[arg(short, long, default_value = "offsync.json")]
        config: PathBuf,
    },
}

/// Contents of the configuration file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    sync: SyncConfig,
    /// Registered transport name.
    transport: String,
    /// Transport-specific settings.
    transport_config: serde_json::Value,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            transport: "memory".to_string(),
            transport_config: serde_json::json!({}),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init {
            config,
            target,
            endpoint,
        } => cmd_init(&config, target, endpoint).await,

        Commands::Enqueue { state, payload } => cmd_enqueue(state, &payload).await,

        Commands::Pending { state } => cmd_pending(state).await,

        Commands::Status { state } => cmd_status(state).await,

        Commands::Flush {
            state,
            endpoint,
            target,
        } => cmd_flush(state, &endpoint, &target).await,

        Commands::Run { config } => cmd_run(&config).await,
    }
}

/// Queue file to use when none is given.
fn default_state_path() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("Could not determine the data directory")?;
    Ok(dir.join("offsync").join("queue.json"))
}

fn resolve_state_path(state: Option<PathBuf>) -> Result<PathBuf> {
    match state {
        Some(path) => Ok(path),
        None => default_state_path(),
    }
}

async fn open_queue(state: Option<PathBuf>) -> Result<PendingQueue> {
    let path = resolve_state_path(state)?;
    PendingQueue::open(&path, SyncConfig::default().queue_capacity)
        .await
        .with_context(|| format!("Failed to open queue at {}", path.display()))
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if !tokio::fs::try_exists(path).await? {
        warn!("No configuration at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
}

/// Write a default configuration file.
async fn cmd_init(path: &Path, target: Option<String>, endpoint: Option<String>) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        anyhow::bail!("{} already exists", path.display());
    }

    let mut config = AppConfig::default();
    config.sync.state_path = Some(default_state_path()?);
    if let Some(target) = target {
        config.sync.target = Some(TargetId::new(target).context("Invalid target")?);
    }
    if let Some(endpoint) = endpoint {
        HttpTransport::new(&endpoint).context("Invalid endpoint")?;
        config.transport = "http".to_string();
        config.transport_config = serde_json::json!({ "endpoint": endpoint });
    }

    let json = serde_json::to_string_pretty(&config)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Configuration written to {}", path.display());
    Ok(())
}

/// Capture one change.
async fn cmd_enqueue(state: Option<PathBuf>, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload must be valid JSON")?;

    let mut queue = open_queue(state).await?;
    let sequence = queue
        .enqueue(payload)
        .await
        .context("Failed to enqueue change")?;

    println!("Enqueued change {} ({} pending)", sequence, queue.size());
    Ok(())
}

/// List pending changes.
async fn cmd_pending(state: Option<PathBuf>) -> Result<()> {
    let queue = open_queue(state).await?;

    if queue.is_empty() {
        println!("(no pending changes)");
        return Ok(());
    }

    for record in queue.snapshot() {
        println!(
            "{:>6}  {}  {}",
            record.sequence,
            record.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            record.payload
        );
    }
    Ok(())
}

/// Show queue counters.
async fn cmd_status(state: Option<PathBuf>) -> Result<()> {
    let queue = open_queue(state).await?;

    println!("Pending queue:");
    if let Some(path) = queue.path() {
        println!("  Location: {}", path.display());
    }
    println!("  Pending: {} / {}", queue.size(), queue.capacity());
    println!("  Delivered up to: {}", queue.high_water());
    println!("  Next sequence: {}", queue.next_sequence());
    Ok(())
}

/// Deliver the queue once and report the outcome.
async fn cmd_flush(state: Option<PathBuf>, endpoint: &str, target: &str) -> Result<()> {
    let target = TargetId::new(target).context("Invalid target")?;
    let transport = Arc::new(HttpTransport::new(endpoint).context("Invalid endpoint")?);
    let config = SyncConfig::new(target).with_state_path(resolve_state_path(state)?);

    let engine = SyncEngine::builder(transport)
        .config(config)
        .start()
        .await
        .context("Failed to start sync engine")?;

    let outcome = engine.sync_now().await.context("Sync failed")?;
    engine.shutdown().await?;

    match outcome {
        SyncOutcome::Delivered {
            records,
            high_water,
        } => println!("Delivered {} changes (up to {})", records, high_water),
        SyncOutcome::Unchanged { acknowledged } => {
            println!("Remote already up to date ({} acknowledged)", acknowledged)
        }
        SyncOutcome::Skipped(reason) => println!("Nothing sent: {:?}", reason),
        SyncOutcome::Failed { error, transient } => {
            if transient {
                anyhow::bail!("Delivery failed, changes kept for retry: {}", error);
            }
            anyhow::bail!("Remote rejected the batch: {}", error);
        }
    }
    Ok(())
}

/// Run an engine until stdin closes or Ctrl-C.
async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;

    let registry = create_default_registry();
    let transport = registry
        .resolve(&config.transport, config.transport_config.clone())
        .with_context(|| format!("Failed to create transport '{}'", config.transport))?;

    let engine = SyncEngine::builder(transport)
        .config(config.sync)
        .start()
        .await
        .context("Failed to start sync engine")?;

    let mut status_rx = engine.subscribe();
    let reporter = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            info!("Status: {}", status);
        }
    });

    info!("Reading changes from stdin (one JSON value per line)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(payload) => {
                        if let Err(e) = engine.notify_change(payload).await {
                            warn!("Change dropped: {}", e);
                        }
                    }
                    Err(e) => warn!("Skipping invalid JSON line: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let pending = engine.status().pending;
    engine.shutdown().await?;
    reporter.abort();

    println!("Stopped with {} pending changes", pending);
    Ok(())
}
