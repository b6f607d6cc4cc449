//! Command implementations, one module per top-level subcommand

pub mod config;
pub mod db;
