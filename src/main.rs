//! georep - Changelog-driven geo-replication
//!
//! One binary for every process of a session: the monitor, the per-brick
//! workers it spawns, their changelog agents and the secondary endpoint
//! reached over ssh. Operator commands read the same configuration file.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use georep::config::{ConfigHandle, GeorepConfig, LoggingConfig};
use georep::error::{Error, Result};
use georep::events::{EventPublisher, NotificationPool};
use georep::monitor::Monitor;
use georep::status::{MonitorStore, StatusStore};
use georep::worker::{self, WorkerOptions};

/// georep - Asynchronous changelog-driven geo-replication
#[derive(Parser)]
#[command(name = "georep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "/etc/georep/georep.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise one worker per configured brick
    Monitor,

    /// Replicate one brick (spawned by the monitor)
    Worker {
        /// Brick root on this node
        #[arg(long)]
        brick: PathBuf,

        /// Secondary URL
        #[arg(long)]
        secondary: String,

        /// Descriptor closed once the worker is connected
        #[arg(long)]
        feedback_fd: Option<i32>,
    },

    /// Serve the changelog query interface on stdio (spawned by a worker)
    Agent {
        /// RPC worker threads
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },

    /// Serve a secondary resource on stdio (reached over ssh)
    Secondary {
        /// Resource URL to serve
        url: String,

        /// Exit after this many seconds without a keep-alive
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show per-brick session status
    Status,

    /// Set the checkpoint target: unix seconds, `now`, or 0 to clear
    Checkpoint {
        value: String,
    },

    /// Write a configuration file with default settings
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "georep.toml")]
        output: PathBuf,

        /// Primary volume name
        #[arg(long, default_value = "gv0")]
        primary_volume: String,

        /// Secondary URL
        #[arg(long, default_value = "geoaccount@backup1::gv1")]
        secondary: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Monitor => {
            let handle = ConfigHandle::load(&cli.config)?;
            init_logging(cli.log_level.as_deref(), &handle.get().logging);
            run_monitor(handle).await
        }
        Commands::Worker {
            brick,
            secondary,
            feedback_fd,
        } => {
            let handle = ConfigHandle::load(&cli.config)?;
            init_logging(cli.log_level.as_deref(), &handle.get().logging);
            run_worker(
                handle,
                WorkerOptions {
                    brick,
                    secondary,
                    feedback_fd,
                },
            )
            .await
        }
        Commands::Agent { workers } => {
            init_logging(cli.log_level.as_deref(), &LoggingConfig::default());
            blocking(move || worker::agent::serve_agent_stdio(workers)).await
        }
        Commands::Secondary { url, timeout } => {
            let mut config = load_or_default(&cli.config)?;
            init_logging(cli.log_level.as_deref(), &config.logging);
            if let Some(secs) = timeout {
                config.transfer.secondary_timeout_secs = secs;
            }
            blocking(move || georep::resource::secondary::serve_stdio(&url, &config)).await
        }
        Commands::Status => run_status(&GeorepConfig::from_file(&cli.config)?),
        Commands::Checkpoint { value } => run_checkpoint(&cli.config, &value),
        Commands::Init {
            output,
            primary_volume,
            secondary,
        } => run_init(&output, primary_volume, secondary),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging on stderr (stdout may carry RPC) or the configured file
fn init_logging(cli_level: Option<&str>, config: &LoggingConfig) {
    let level = cli_level.unwrap_or(&config.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let file = config.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("cannot open log file {}: {}", path.display(), e))
            .ok()
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    match file {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .init(),
        None => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Configuration for processes that can run without a file
fn load_or_default(path: &Path) -> Result<GeorepConfig> {
    if path.exists() {
        GeorepConfig::from_file(path)
    } else {
        Ok(GeorepConfig::default())
    }
}

async fn blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

/// Run the monitor until shutdown
async fn run_monitor(handle: ConfigHandle) -> Result<()> {
    let config = handle.get();
    tracing::info!(
        "starting monitor: {} -> {}",
        config.session.primary_volume,
        config.session.secondary
    );
    let pool = NotificationPool::start(&config.events)?;
    Monitor::new(handle, Some(pool)).run().await
}

/// Run one worker; returns only on failure
async fn run_worker(handle: ConfigHandle, options: WorkerOptions) -> Result<()> {
    let config = handle.get();
    let pool = if config.events.webhooks.is_empty() {
        None
    } else {
        Some(NotificationPool::start(&config.events)?)
    };
    let events = pool
        .as_ref()
        .map(NotificationPool::publisher)
        .unwrap_or_else(EventPublisher::disabled);

    tracing::info!(
        "worker for {} starting (secondary {})",
        options.brick.display(),
        options.secondary
    );
    let result = blocking(move || worker::run(handle, options, events)).await;
    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    result
}

/// Print one line per brick
fn run_status(config: &GeorepConfig) -> Result<()> {
    let monitor = MonitorStore::new(&config.session.state_dir);
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    println!(
        "{:<16} {:<12} {:<28} {:<16} {:<16} {:<16} {:<20} {:>6} {:>6} {:>6} {:>8} {:<10}",
        "PRIMARY NODE",
        "PRIMARY VOL",
        "PRIMARY BRICK",
        "SECONDARY NODE",
        "STATUS",
        "CRAWL STATUS",
        "LAST SYNCED",
        "ENTRY",
        "DATA",
        "META",
        "FAILURES",
        "CHECKPOINT"
    );
    println!("{}", "-".repeat(170));
    for brick in &config.bricks {
        let status = StatusStore::new(&config.session.state_dir, &brick.path).get_status(&monitor)?;
        println!(
            "{:<16} {:<12} {:<28} {:<16} {:<16} {:<16} {:<20} {:>6} {:>6} {:>6} {:>8} {:<10}",
            host,
            config.session.primary_volume,
            brick.path.display(),
            status.slave_node,
            status.worker_status,
            status.crawl_status,
            human_time(status.last_synced),
            status.entry,
            status.data,
            status.meta,
            status.failures,
            status.checkpoint_completed
        );
    }
    Ok(())
}

fn human_time(ts: i64) -> String {
    if ts <= 0 {
        return "N/A".to_string();
    }
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Store a new checkpoint target; running workers pick it up on their next round
fn run_checkpoint(path: &Path, value: &str) -> Result<()> {
    let ts = match value {
        "now" => chrono::Utc::now().timestamp(),
        other => other
            .parse::<i64>()
            .map_err(|_| Error::Config(format!("invalid checkpoint {}", other)))?,
    };
    GeorepConfig::store_checkpoint(path, ts)?;
    if ts == 0 {
        println!("Checkpoint cleared");
    } else {
        println!("Checkpoint set to {} ({})", ts, human_time(ts));
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: &Path, primary_volume: String, secondary: String) -> Result<()> {
    let mut config = GeorepConfig::default();
    config.session.primary_volume = primary_volume;
    config.session.secondary = secondary;

    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("cannot render config: {}", e)))?;
    let content = format!(
        "# georep configuration\n# Add one [[bricks]] table per local brick:\n#\n# [[bricks]]\n# path = \"/bricks/b1\"\n\n{}",
        rendered
    );
    std::fs::write(output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: georep monitor --config {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(path: &Path) -> Result<()> {
    let config = GeorepConfig::from_file(path)?;
    config.validate_session()?;
    println!("Configuration is valid");
    println!("  Primary volume: {}", config.session.primary_volume);
    println!("  Secondary:      {}", config.session.secondary);
    println!("  Bricks:         {}", config.bricks.len());
    for brick in &config.bricks {
        println!("    {} -> {}", brick.path.display(), config.secondary_for(brick));
    }
    println!("  State dir:      {}", config.session.state_dir.display());
    println!("  Transfer:       {:?}", config.transfer.engine);
    Ok(())
}
