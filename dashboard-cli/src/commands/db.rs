//! Database commands
//!
//! Commands: ping, create-schema, drop-schema

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dashboard_core::{redact_url, Settings};
use dashboard_db::{Engine, SchemaRegistry};
use tracing::info;

#[derive(Parser, Debug)]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommands,
}

#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Check connectivity with a `SELECT 1` round trip
    Ping,
    /// Create every entity defined in the schema directory
    CreateSchema(SchemaArgs),
    /// Drop every entity defined in the schema directory, in reverse order
    DropSchema(DropSchemaArgs),
}

#[derive(Parser, Debug)]
pub struct SchemaArgs {
    /// Directory of <order>_<entity>.up.sql / .down.sql files
    #[arg(long, value_name = "DIR", default_value = "schema")]
    pub schema_dir: PathBuf,
}

#[derive(Parser, Debug)]
pub struct DropSchemaArgs {
    #[command(flatten)]
    pub schema: SchemaArgs,

    /// Confirm dropping all registered entities
    #[arg(long)]
    pub yes: bool,
}

pub async fn run(args: DbArgs, settings: Settings) -> Result<()> {
    match args.command {
        DbCommands::Ping => run_ping(&settings).await,
        DbCommands::CreateSchema(args) => run_create_schema(&settings, &args.schema_dir).await,
        DbCommands::DropSchema(args) => {
            if !args.yes {
                bail!("Refusing to drop the schema without --yes");
            }
            run_drop_schema(&settings, &args.schema.schema_dir).await
        }
    }
}

fn load_registry(dir: &Path) -> Result<SchemaRegistry> {
    let registry = SchemaRegistry::from_dir(dir)?;
    if registry.is_empty() {
        bail!("No schema definitions found in {}", dir.display());
    }
    info!(dir = %dir.display(), entities = registry.len(), "loaded schema definitions");
    Ok(registry)
}

fn engine(settings: &Settings, registry: SchemaRegistry) -> Result<Engine> {
    Engine::initialize(settings, registry).with_context(|| {
        format!(
            "Failed to configure database engine for {}",
            redact_url(&settings.database.async_url)
        )
    })
}

async fn run_ping(settings: &Settings) -> Result<()> {
    let engine = engine(settings, SchemaRegistry::new())?;
    let result = engine.ping().await;
    engine.close().await;

    result.context("Database ping failed")?;
    println!("Database reachable: {}", redact_url(&settings.database.url));
    Ok(())
}

async fn run_create_schema(settings: &Settings, dir: &Path) -> Result<()> {
    let engine = engine(settings, load_registry(dir)?)?;
    let result = engine.create_schema().await;
    engine.close().await;

    result.context("Schema creation failed")?;
    println!("Created {} entities", engine.registry().len());
    Ok(())
}

async fn run_drop_schema(settings: &Settings, dir: &Path) -> Result<()> {
    let engine = engine(settings, load_registry(dir)?)?;
    let result = engine.drop_schema().await;
    engine.close().await;

    result.context("Schema drop failed")?;
    println!("Dropped {} entities", engine.registry().len());
    Ok(())
}
