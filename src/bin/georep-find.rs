//! georep-find - Incremental change listing for a volume
//!
//! Usage:
//!   georep-find create <session> <volume> [--force]
//!   georep-find pre <session> <volume> <outfile> [--full] [--no-encode]
//!   georep-find post <session> <volume>
//!   georep-find cleanup <session> <volume>
//!   georep-find delete <session> <volume>
//!   georep-find list [--session S] [--volume V]
//!
//! `node-changelog` and `node-brickfind` are the per-brick agents `pre`
//! runs locally or over ssh.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use georep::config::GeorepConfig;
use georep::error::Error;
use georep::events::{EventPublisher, NotificationPool};
use georep::find::{self, FindTool, NodeJob, NodeMode, PreOptions, ProcessRunner};

/// Session-based changelog find tool
#[derive(Parser)]
#[command(name = "georep-find")]
#[command(about = "List files changed on a volume since the last session run", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "/etc/georep/georep.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session for a volume
    Create {
        session: String,
        volume: String,
        /// Reuse an existing session
        #[arg(long)]
        force: bool,
    },
    /// Write everything changed since the session time to an output file
    Pre {
        session: String,
        volume: String,
        outfile: PathBuf,
        /// List every file instead of the changes
        #[arg(long)]
        full: bool,
        /// Prefix joined in front of every path
        #[arg(long, default_value = ".")]
        output_prefix: String,
        /// Write paths without escaping
        #[arg(long)]
        no_encode: bool,
    },
    /// Commit the time recorded by the last pre
    Post { session: String, volume: String },
    /// Remove scratch files left by pre
    Cleanup { session: String, volume: String },
    /// Delete a session
    Delete { session: String, volume: String },
    /// List sessions
    List {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        volume: Option<String>,
    },
    /// Per-brick changelog agent
    #[command(hide = true)]
    NodeChangelog(NodeArgs),
    /// Per-brick full crawl agent
    #[command(hide = true)]
    NodeBrickfind(NodeArgs),
}

#[derive(clap::Args)]
struct NodeArgs {
    session: String,
    volume: String,
    brick: PathBuf,
    outdb: PathBuf,
    start: i64,
    end: i64,
}

impl NodeArgs {
    fn job(self, mode: NodeMode) -> NodeJob {
        NodeJob {
            mode,
            session: self.session,
            volume: self.volume,
            host: "localhost".to_string(),
            brick: self.brick,
            outdb: self.outdb,
            start: self.start,
            end: self.end,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e.downcast_ref::<Error>().map_or(1, Error::exit_code);
        std::process::exit(code);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(load_config(&cli.config)?);
    std::fs::create_dir_all(&config.find.session_dir)
        .with_context(|| format!("cannot create {}", config.find.session_dir.display()))?;

    let pool = if config.events.webhooks.is_empty() {
        None
    } else {
        Some(NotificationPool::start(&config.events)?)
    };
    let events = pool
        .as_ref()
        .map(NotificationPool::publisher)
        .unwrap_or_else(EventPublisher::disabled);

    let tool = FindTool::new(Arc::clone(&config), events);
    let result = match cli.command {
        Commands::Create { session, volume, force } => tool.create(&session, &volume, force),
        Commands::Pre {
            session,
            volume,
            outfile,
            full,
            output_prefix,
            no_encode,
        } => {
            let opts = PreOptions {
                session,
                volume,
                outfile,
                full,
                output_prefix,
                no_encode,
            };
            let runner = ProcessRunner {
                program: std::env::current_exe()?,
                config_path: cli.config.exists().then(|| cli.config.clone()),
                transfer: config.transfer.clone(),
                debug: cli.debug,
            };
            tokio::task::spawn_blocking(move || {
                tool.pre(&opts, &runner)
                    .map(|_| println!("Generated output file {}", opts.outfile.display()))
            })
            .await?
        }
        Commands::Post { session, volume } => tool.post(&session, &volume),
        Commands::Cleanup { session, volume } => tool.cleanup(&session, &volume),
        Commands::Delete { session, volume } => tool.delete(&session, &volume),
        Commands::List { session, volume } => tool
            .list(session.as_deref(), volume.as_deref())
            .map(|entries| print!("{}", find::render_list(&entries))),
        Commands::NodeChangelog(args) => find::node::run_local(&config, &args.job(NodeMode::Changelog)),
        Commands::NodeBrickfind(args) => find::node::run_local(&config, &args.job(NodeMode::Brickfind)),
    };

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    result.map_err(anyhow::Error::from)
}

fn load_config(path: &std::path::Path) -> anyhow::Result<GeorepConfig> {
    if !path.exists() {
        tracing::debug!("{} not found, using defaults", path.display());
        return Ok(GeorepConfig::default());
    }
    GeorepConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}
