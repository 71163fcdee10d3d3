//! Configuration management CLI commands.
//!
//! Provides `config path`, `config show` and `config init`.

use std::path::PathBuf;

use clap::Subcommand;
use envmount::config::{default_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// Print the effective configuration
    Show,

    /// Write a configuration file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Path => run_path(),
        ConfigCommands::Show => run_show(),
        ConfigCommands::Init { force } => run_init(force),
    }
}

fn config_path() -> Result<PathBuf, CliError> {
    default_path().ok_or_else(|| CliError::Config("no configuration directory".to_string()))
}

/// Show the configuration file path.
fn run_path() -> Result<(), CliError> {
    println!("{}", config_path()?.display());
    Ok(())
}

/// Print the effective configuration.
fn run_show() -> Result<(), CliError> {
    let config = ConfigFile::load_default()?;
    print!("{}", config.to_ini_string()?);
    Ok(())
}

/// Write the default configuration.
fn run_init(force: bool) -> Result<(), CliError> {
    let path = config_path()?;
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        )));
    }

    let text = ConfigFile::default().to_ini_string()?;
    let write = |path: &PathBuf| -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, text.as_bytes())
    };
    write(&path).map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;

    println!("Wrote {}", path.display());
    Ok(())
}
