//! dashboard CLI - operator entry point for the analytics dashboard backend
//!
//! Loads the settings snapshot once, sets up logging from it, and dispatches to:
//! - `config` (show the redacted snapshot, validate it)
//! - `db` (ping the database, create or drop the registered schema)

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use dashboard_core::{ConfigError, Settings};

mod commands;
mod tracing_setup;

use tracing_setup::TracingConfig;

#[derive(Parser, Debug)]
#[command(
    name = "dashboard",
    author,
    version,
    about = "Configuration and database tooling for the analytics dashboard backend",
    long_about = "Inspect and validate the settings snapshot built from the environment and \
                  .env file, check database connectivity, and create or drop the schema."
)]
struct Cli {
    /// Enable debug logging (RUST_LOG still takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    /// Env file to read before the process environment (default: ./.env if present)
    #[arg(long, global = true, value_name = "PATH", env = "DASHBOARD_ENV_FILE")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and validate settings (show, check)
    Config(commands::config::ConfigArgs),
    /// Database operations (ping, create-schema, drop-schema)
    Db(commands::db::DbArgs),
}

fn load_settings(env_file: Option<&Path>) -> Result<Settings, ConfigError> {
    match env_file {
        Some(path) => Settings::load_from_file(path),
        None => Settings::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.env_file {
        if !path.is_file() {
            bail!("Env file not found: {}", path.display());
        }
    }

    let settings = load_settings(cli.env_file.as_deref());
    let tracing_config = match &settings {
        Ok(settings) => TracingConfig {
            debug: cli.debug,
            level: settings.logging.filter_directive().to_string(),
            file: settings.logging.file.clone(),
        },
        Err(_) => TracingConfig {
            debug: cli.debug,
            ..TracingConfig::default()
        },
    };
    if let Err(err) = tracing_setup::init(&tracing_config) {
        eprintln!("warning: logging disabled: {err:#}");
    }

    match cli.command {
        Commands::Config(args) => commands::config::run(args, settings),
        Commands::Db(args) => commands::db::run(args, settings?).await,
    }
}
