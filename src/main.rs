//! Observer Evolution - command line entry point
//!
//! Runs evolution cycles against a SQLite store and inspects the versioned
//! entities they produce.

mod cli;

use clap::{Parser, Subcommand};
use cli::config::ConfigAction;
use observer_evolution::Scope;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "observer-evolution")]
#[command(about = "Self-evolving memory, behavior and agent tuning", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Database path (defaults to the platform data directory)
    #[arg(long, env = "OBSERVER_EVOLUTION_DB")]
    db_path: Option<PathBuf>,

    /// Scope to evolve: global, device:<id> or session:<id>
    #[arg(long, default_value = "session:default")]
    scope: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run evolution cycles
    Run {
        /// Config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Feedback events to ingest first (JSON lines)
        #[arg(short, long)]
        feedback: Option<PathBuf>,

        /// Number of cycles to run
        #[arg(long, default_value = "1", conflicts_with = "follow")]
        cycles: usize,

        /// Keep polling until interrupted
        #[arg(long)]
        follow: bool,
    },

    /// Manage configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the version history of an entity
    History {
        /// memory_params, behavior_profile or agent:<uuid>
        #[arg(short, long)]
        target: String,

        /// Print commit records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Restore the previous version of an entity
    Rollback {
        /// memory_params, behavior_profile or agent:<uuid>
        #[arg(short, long)]
        target: String,

        #[arg(short, long, default_value = "manual rollback")]
        reason: String,
    },

    /// Run health checks
    Health {
        /// Config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::new(format!(
        "observer_evolution={}",
        level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Observer Evolution v{} starting...", env!("CARGO_PKG_VERSION"));

    let scope: Scope = cli.scope.parse()?;

    match cli.command {
        Commands::Run {
            config,
            feedback,
            cycles,
            follow,
        } => {
            let config = cli::helpers::load_config(config.as_deref())?;
            let store = cli::helpers::open_store(cli.db_path)?;
            cli::run::handle(store, scope, config, feedback.as_deref(), cycles, follow).await
        }
        Commands::Config { action } => cli::config::handle(action),
        Commands::History { target, json } => {
            let store = cli::helpers::open_store(cli.db_path)?;
            cli::history::handle(store, scope, &target, json).await
        }
        Commands::Rollback { target, reason } => {
            let store = cli::helpers::open_store(cli.db_path)?;
            cli::rollback::handle(store, scope, &target, &reason).await
        }
        Commands::Health { config, json } => {
            let config = cli::helpers::load_config(config.as_deref())?;
            let store = cli::helpers::open_store(cli.db_path)?;
            cli::health::handle(store, scope, config, json).await
        }
    }
}
