//! CLI parser and command dispatch.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "docuflow")]
#[command(about = "Human-in-the-loop document scanning, OCR, and filing system")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery of ./docuflow.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short = 't', long, global = true)]
    target: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database
    Init,

    /// Analyze and process everything in the intake directory
    Scan {
        /// Worker pool size (defaults to logical CPU count)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Start the web server
    Serve {
        /// Bind address: port, host, or host:port
        #[arg(short, long, default_value = "127.0.0.1:8737")]
        bind: String,
    },

    /// Export a verified batch into the filing cabinet
    Export {
        /// Batch id to export
        batch_id: i64,
    },

    /// Show batch and cache status
    Status,

    /// Force a normalized-cache garbage collection pass
    Gc,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(target) = cli.target {
        settings.data_dir = target;
    }

    match cli.command {
        Commands::Init => commands::cmd_init(&settings),
        Commands::Scan { workers } => {
            if let Some(workers) = workers {
                settings.workers = workers.max(1);
            }
            commands::cmd_scan(settings).await
        }
        Commands::Serve { bind } => commands::cmd_serve(settings, &bind).await,
        Commands::Export { batch_id } => commands::cmd_export(settings, batch_id).await,
        Commands::Status => commands::cmd_status(settings),
        Commands::Gc => commands::cmd_gc(&settings),
    }
}
