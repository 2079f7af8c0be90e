//! fleetguard — operator CLI for the cluster rollout registry.
//!
//! # Usage
//!
//! ```text
//! fleetguard --data-dir /var/lib/fleetguard register --config fleetguard.toml
//! fleetguard list --batch canary
//! fleetguard can-proceed --config fleetguard.toml --batch prod
//! fleetguard compare --baseline before.json --current after.json
//! fleetguard rollback --batch prod --reason "p99 regression"
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "fleetguard",
    about = "fleetguard — progressive cluster upgrade rollouts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Directory holding the registry database.
    #[arg(long, global = true, default_value = "/var/lib/fleetguard")]
    data_dir: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the `[[clusters]]` of a config file.
    Register {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show one cluster record.
    Status {
        #[arg(long)]
        cluster: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// List registered clusters.
    List {
        #[arg(long)]
        batch: Option<String>,
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Load and validate a config file.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Compare two JSON metric snapshots. Exits 1 when validation fails.
    Compare {
        #[arg(long)]
        baseline: PathBuf,
        #[arg(long)]
        current: PathBuf,
        /// Take thresholds from this config instead of the defaults.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Check whether a batch's prerequisites are healthy.
    CanProceed {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        batch: String,
    },
    /// Mark a batch for manual rollback. Exits 1 if a cluster was busy.
    Rollback {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        reason: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetguard=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Register { config } => commands::registry::register(&cli.data_dir, &config),
        Commands::Status { cluster, format } => {
            commands::registry::status(&cli.data_dir, &cluster, &format)
        }
        Commands::List { batch, format } => {
            commands::registry::list(&cli.data_dir, batch.as_deref(), &format)
        }
        Commands::CheckConfig { config } => commands::config::check(&config),
        Commands::Compare {
            baseline,
            current,
            config,
        } => commands::compare::compare(&baseline, &current, config.as_deref()),
        Commands::CanProceed { config, batch } => {
            commands::config::can_proceed(&cli.data_dir, &config, &batch)
        }
        Commands::Rollback { batch, reason } => {
            commands::rollback::rollback(&cli.data_dir, &batch, &reason)
        }
    }
}
