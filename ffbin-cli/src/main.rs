//! ffbin command-line host
//!
//! Installs the cached FFmpeg binaries into workspace `bin` directories.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Shared FFmpeg binary cache.
#[derive(Debug, Parser)]
#[command(name = "ffbin", version, about)]
pub struct Cli {
    /// Cache root, overriding the settings file and FFBIN_CACHE_DIR.
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Settings file to load instead of the per-user one.
    #[arg(long, global = true, env = "FFBIN_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install ffmpeg and ffprobe into a bin directory.
    Install {
        bin_path: PathBuf,
        /// Create the directory if it does not exist.
        #[arg(long)]
        create: bool,
    },
    /// Remove the installed binaries from a bin directory.
    Uninstall { bin_path: PathBuf },
    /// Print the path of an installed tool.
    Which { bin_path: PathBuf, tool: String },
    /// Show cache and installation state for a bin directory.
    Status {
        bin_path: PathBuf,
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// List published cache entries.
    Cache {
        /// Only print the cache root.
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    tracing::debug!("Starting ffbin v{}", ffbin_core::VERSION);

    commands::run(cli).await
}

fn init_logging(verbose: bool) {
    let directive = if verbose { "ffbin=debug" } else { "ffbin=info" };

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = directive.parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
