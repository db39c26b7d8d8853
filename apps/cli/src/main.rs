//! SwarmSync CLI - fetch files from a swarm of sources
//!
//! Drives the transfer core from the command line: swarmed downloads from
//! HTTP sources, transfer history, resume data and settings.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use swarmsync_types::Priority;
use tracing_subscriber::EnvFilter;

/// SwarmSync - swarmed file transfers
#[derive(Parser)]
#[command(name = "swarmsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for settings, transfer history and resume data
    #[arg(long, env = "SWARMSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file from one or more HTTP sources
    Get {
        /// Path of the file inside the download root
        path: String,

        /// Source URL, repeat to swarm over several sources
        #[arg(short, long = "source", required = true)]
        sources: Vec<url::Url>,

        /// File size in bytes (probed from the sources when omitted)
        #[arg(long)]
        size: Option<u64>,

        /// Expected SHA-256 of the content, hex encoded
        #[arg(long)]
        hash: Option<String>,

        /// Version number of the file
        #[arg(long, default_value_t = 1)]
        version: u64,

        /// Scheduling priority
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Download rate limit in bytes/sec for this run
        #[arg(long)]
        rate: Option<u64>,
    },

    /// List persisted transfers
    List {
        /// Only completed transfers
        #[arg(short, long)]
        completed: bool,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Clear completed transfers
    Clear,

    /// Show resume data of incomplete downloads
    Partials {
        /// Remove orphaned and expired partial files
        #[arg(long)]
        gc: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "swarmsync_cli=debug,swarmsync_core=debug"
    } else {
        "swarmsync_cli=info,swarmsync_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "swarmsync", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("swarmsync"))
            .unwrap_or_else(|| PathBuf::from(".swarmsync-data"))
    });

    let core = swarmsync_core::TransferCore::new(data_dir).await?;

    match cli.command {
        Commands::Get {
            path,
            sources,
            size,
            hash,
            version,
            priority,
            rate,
        } => {
            let request = commands::GetRequest {
                path,
                sources,
                size,
                hash,
                version,
                priority,
                rate,
            };
            commands::get_file(&core, request, cli.output).await?
        }

        Commands::List { completed, all } => {
            commands::list_transfers(&core, completed, all, cli.output).await?
        }

        Commands::Clear => commands::clear_completed(&core, cli.output).await?,

        Commands::Partials { gc } => commands::show_partials(&core, gc, cli.output).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
