//! envmount CLI - Command-line interface
//!
//! Inspection tools for package environments: lock file diffs, library
//! metadata, remote image probing and configuration.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::config::ConfigCommands;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "envmount", version, about = "Bootstrap package environments into virtual filesystems")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show what changes between two environment lock files
    Diff {
        /// Currently installed environment lock
        old: PathBuf,
        /// Newly resolved environment lock
        new: PathBuf,
    },

    /// List the packages of an environment lock file
    Packages {
        /// Environment lock file
        lock: PathBuf,
    },

    /// Print the dynamic-linking metadata of a shared library
    Dylink {
        /// Library file
        file: PathBuf,
    },

    /// Determine the size and block layout of a remote image
    Probe {
        /// Image URL
        url: String,

        /// Fixed block size in bytes instead of reading the superblock
        #[arg(long)]
        block_size: Option<u32>,

        /// Also fetch the first N blocks
        #[arg(long, default_value_t = 0)]
        blocks: u32,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "envmount=info",
        1 => "envmount=debug",
        _ => "envmount=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Diff { old, new } => commands::diff::run_diff(&old, &new),
        Commands::Packages { lock } => commands::diff::run_packages(&lock),
        Commands::Dylink { file } => commands::dylink::run(&file),
        Commands::Probe {
            url,
            block_size,
            blocks,
        } => commands::probe::run(&url, block_size, blocks).await,
        Commands::Config { command } => commands::config::run(command),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
