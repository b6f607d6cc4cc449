//! Settings inspection commands
//!
//! Commands: show, check

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dashboard_core::{redact_url, ConfigError, Settings};
use serde_json::Value;

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the settings snapshot with secrets masked
    Show(ShowArgs),
    /// Load and validate settings, failing on the first invalid field
    Check,
}

#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

pub fn run(args: ConfigArgs, settings: Result<Settings, ConfigError>) -> Result<()> {
    match args.command {
        ConfigCommands::Show(show) => {
            let settings = settings.context("Failed to load settings")?;
            run_show(&settings, show.format)
        }
        ConfigCommands::Check => run_check(settings),
    }
}

fn run_show(settings: &Settings, format: OutputFormat) -> Result<()> {
    let redacted = settings.redacted();
    match format {
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&redacted)
                .context("Failed to serialize settings")?;
            println!("{rendered}");
        }
        OutputFormat::Text => {
            for (key, value) in flatten(&redacted) {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

fn run_check(settings: Result<Settings, ConfigError>) -> Result<()> {
    match settings {
        Ok(settings) => {
            tracing::debug!(environment = %settings.environment, "settings validated");
            println!(
                "Configuration OK (environment: {}, database: {})",
                settings.environment,
                redact_url(&settings.database.url)
            );
            if settings.security.secret_key_generated {
                println!("Note: SECRET_KEY not set, a random key was generated for this process");
            }
            Ok(())
        }
        Err(err) => Err(anyhow!("Configuration invalid: {err}")),
    }
}

/// `section.key = value` pairs sorted by key, arrays rendered as JSON
fn flatten(value: &Value) -> Vec<(String, String)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, child, out);
                }
            }
            Value::String(text) => out.push((prefix.to_string(), text.clone())),
            Value::Null => out.push((prefix.to_string(), String::new())),
            other => out.push((prefix.to_string(), other.to_string())),
        }
    }

    let mut out = Vec::new();
    walk("", value, &mut out);
    out
}
