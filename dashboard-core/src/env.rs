//! Environment sources for the settings loader.
//!
//! Variables come from two places:
//! 1. The process environment (highest priority)
//! 2. An optional env file, `.env` in the working directory by default
//!
//! The env file is read with `dotenvy`'s iterator API so loading never
//! mutates the process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, Result};

/// Default env file name, resolved against the working directory
pub const DEFAULT_ENV_FILE: &str = ".env";

/// A resolved, case-sensitive set of environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars {
    vars: BTreeMap<String, String>,
}

impl EnvVars {
    /// Process environment only
    pub fn from_process() -> Self {
        Self::from_iter(std::env::vars())
    }

    /// Env file entries overlaid by the process environment.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn with_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut env = Self::from_file(path.as_ref())?;
        env.vars.extend(std::env::vars());
        Ok(env)
    }

    /// Entries of a single env file, ignoring the process environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(err) if err.not_found() => {
                debug!(path = %path.display(), "no env file found");
                return Ok(Self::default());
            }
            Err(err) => return Err(ConfigError::env_file(path, err)),
        };

        let mut vars = BTreeMap::new();
        for item in iter {
            let (key, value) = item.map_err(|err| ConfigError::env_file(path, err))?;
            vars.insert(key, value);
        }

        info!(path = %path.display(), count = vars.len(), "loaded env file");
        Ok(Self { vars })
    }

    /// Look up a variable. Blank values count as unset; anything else is returned as written.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Set or replace a variable
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for EnvVars
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Default env file path (`./.env`)
pub fn default_env_file() -> PathBuf {
    PathBuf::from(DEFAULT_ENV_FILE)
}
