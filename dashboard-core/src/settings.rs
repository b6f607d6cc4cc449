//! The configuration snapshot.
//!
//! Every setting maps to one upper-case environment variable of the same name
//! (`DATABASE_URL`, `DB_POOL_SIZE`, ...). Loading happens once at process start:
//!
//! 1. Base fields are parsed and validated, failing with the variable name on error
//! 2. Derived fields run through the ordered pipeline in [`crate::derive`]
//! 3. The result is handed out by reference and never changes afterwards

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::derive::{self, ListInput};
use crate::env::{self, EnvVars};
use crate::error::{ConfigError, Result};

/// `ENVIRONMENT` value that selects test behaviour (no connection pooling)
pub const TEST_ENVIRONMENT: &str = "test";

const REDACTED: &str = "***";

const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["csv", "json", "xlsx"];

const LOG_LEVELS: &[&str] = &["TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL"];

/// Immutable configuration snapshot for the dashboard backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub project: ProjectSettings,
    pub environment: String,
    pub debug: bool,
    pub security: SecuritySettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub cors_origins: Vec<String>,
    pub logging: LoggingSettings,
    pub websocket: WebSocketSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    pub smtp: SmtpSettings,
    pub metrics: MetricsSettings,
    pub uploads: UploadSettings,
    pub tasks: TaskQueueSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSettings {
    pub name: String,
    pub version: String,
    pub description: String,
    pub api_v1_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecuritySettings {
    pub secret_key: String,
    /// True when `SECRET_KEY` was unset and a random key was generated for this process
    pub secret_key_generated: bool,
    pub algorithm: String,
    pub access_token_expire_minutes: u32,
    pub refresh_token_expire_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub async_url: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_recycle_secs: u64,
    pub pool_pre_ping: bool,
    pub pool_timeout_secs: u64,
}

impl DatabaseSettings {
    /// Upper bound on concurrently open connections
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }

    pub fn pool_recycle(&self) -> Duration {
        Duration::from_secs(self.pool_recycle_secs)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedisSettings {
    pub url: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl LoggingSettings {
    /// `tracing` filter directive for the configured level (`WARNING` -> `warn`)
    pub fn filter_directive(&self) -> &'static str {
        match self.level.to_ascii_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebSocketSettings {
    pub max_connections: u32,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitSettings {
    pub requests: u32,
    pub period_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmtpSettings {
    pub tls: bool,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSettings {
    pub max_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskQueueSettings {
    pub broker_url: String,
    pub result_backend: String,
}

impl Settings {
    /// Load from `./.env` overlaid by the process environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(env::default_env_file())
    }

    /// Load from an explicit env file overlaid by the process environment
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_env(&EnvVars::with_env_file(path)?)
    }

    /// Build from an explicit variable set, ignoring the process environment
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::from_env(&vars.into_iter().collect())
    }

    /// Parse, validate and derive the snapshot from resolved variables
    pub fn from_env(env: &EnvVars) -> Result<Self> {
        let fields = FieldReader { env };

        let database_url = fields.string("DATABASE_URL", derive::DEFAULT_DATABASE_URL);
        validate_postgres_dsn("DATABASE_URL", &database_url)?;

        let pool_size = fields.parse("DB_POOL_SIZE", 10u32)?;
        let max_overflow = fields.parse("DB_MAX_OVERFLOW", 20u32)?;
        if pool_size.saturating_add(max_overflow) == 0 {
            return Err(ConfigError::validation(
                "DB_POOL_SIZE",
                "DB_POOL_SIZE + DB_MAX_OVERFLOW must allow at least one connection",
            ));
        }

        let redis_url = fields.string("REDIS_URL", derive::DEFAULT_REDIS_URL);
        validate_redis_dsn("REDIS_URL", &redis_url)?;

        let level = fields.string("LOG_LEVEL", "INFO");
        if !LOG_LEVELS.contains(&level.to_ascii_uppercase().as_str()) {
            return Err(ConfigError::validation(
                "LOG_LEVEL",
                format!("unknown level '{level}', expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        let (secret_key, secret_key_generated) = match fields.optional("SECRET_KEY") {
            Some(secret) => (secret, false),
            None => {
                debug!("SECRET_KEY not set, generating a process-local key");
                (generate_secret(), true)
            }
        };

        // Derived fields, in order. An explicit value always wins.
        let async_url = match fields.optional("ASYNC_DATABASE_URL") {
            Some(url) => url,
            None => derive::async_database_url(Some(database_url.as_str())),
        };
        validate_postgres_dsn("ASYNC_DATABASE_URL", &async_url)?;

        let broker_url = fields
            .optional("CELERY_BROKER_URL")
            .unwrap_or_else(|| derive::broker_url(&redis_url));
        let result_backend = fields
            .optional("CELERY_RESULT_BACKEND")
            .unwrap_or_else(|| derive::result_backend_url(&redis_url));

        let cors_origins = match fields.optional("BACKEND_CORS_ORIGINS") {
            Some(raw) => derive::parse_cors_origins(ListInput::Text(raw))
                .map_err(|reason| ConfigError::validation("BACKEND_CORS_ORIGINS", reason))?,
            None => DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
        };
        for origin in &cors_origins {
            validate_http_url("BACKEND_CORS_ORIGINS", origin)?;
        }

        let settings = Self {
            project: ProjectSettings {
                name: fields.string("PROJECT_NAME", "Real-time Analytics Dashboard"),
                version: fields.string("PROJECT_VERSION", "1.0.0"),
                description: fields.string(
                    "DESCRIPTION",
                    "A modern real-time analytics dashboard with interactive charts and live data streaming",
                ),
                api_v1_prefix: fields.string("API_V1_STR", "/api/v1"),
            },
            environment: fields.string("ENVIRONMENT", "development"),
            debug: fields.flag("DEBUG", true)?,
            security: SecuritySettings {
                secret_key,
                secret_key_generated,
                algorithm: fields.string("ALGORITHM", "HS256"),
                access_token_expire_minutes: fields.parse("ACCESS_TOKEN_EXPIRE_MINUTES", 30)?,
                refresh_token_expire_minutes: fields
                    .parse("REFRESH_TOKEN_EXPIRE_MINUTES", 60 * 24 * 7)?,
            },
            database: DatabaseSettings {
                url: database_url,
                async_url,
                pool_size,
                max_overflow,
                pool_recycle_secs: fields.parse("DB_POOL_RECYCLE", 300)?,
                pool_pre_ping: fields.flag("DB_POOL_PRE_PING", true)?,
                pool_timeout_secs: fields.parse("DB_POOL_TIMEOUT", 30)?,
            },
            redis: RedisSettings {
                url: redis_url,
                password: fields.optional("REDIS_PASSWORD"),
            },
            cors_origins,
            logging: LoggingSettings {
                level,
                file: fields.optional("LOG_FILE").map(PathBuf::from),
            },
            websocket: WebSocketSettings {
                max_connections: fields.parse("WS_MAX_CONNECTIONS", 100)?,
                heartbeat_interval_secs: fields.parse("WS_HEARTBEAT_INTERVAL", 30)?,
            },
            cache: CacheSettings {
                ttl_secs: fields.parse("CACHE_TTL", 300)?,
                prefix: fields.string("CACHE_PREFIX", "analytics:"),
            },
            rate_limit: RateLimitSettings {
                requests: fields.parse("RATE_LIMIT_REQUESTS", 100)?,
                period_secs: fields.parse("RATE_LIMIT_PERIOD", 60)?,
            },
            smtp: SmtpSettings {
                tls: fields.flag("SMTP_TLS", true)?,
                port: fields.optional_parse("SMTP_PORT")?,
                host: fields.optional("SMTP_HOST"),
                user: fields.optional("SMTP_USER"),
                password: fields.optional("SMTP_PASSWORD"),
                from_email: fields.optional("EMAILS_FROM_EMAIL"),
                from_name: fields.optional("EMAILS_FROM_NAME"),
            },
            metrics: MetricsSettings {
                enabled: fields.flag("ENABLE_METRICS", true)?,
                port: fields.parse("METRICS_PORT", 9090)?,
            },
            uploads: UploadSettings {
                max_size_bytes: fields.parse("MAX_UPLOAD_SIZE", 10 * 1024 * 1024)?,
                allowed_extensions: fields.list("ALLOWED_EXTENSIONS", DEFAULT_ALLOWED_EXTENSIONS)?,
            },
            tasks: TaskQueueSettings {
                broker_url,
                result_backend,
            },
        };

        if settings.security.secret_key_generated && !settings.is_test() && !settings.debug {
            warn!("SECRET_KEY is not set; issued tokens will not survive a restart");
        }

        Ok(settings)
    }

    /// Whether `ENVIRONMENT` selects test behaviour
    pub fn is_test(&self) -> bool {
        self.environment == TEST_ENVIRONMENT
    }

    /// JSON view of the snapshot with secrets and URL passwords masked
    pub fn redacted(&self) -> Value {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(_) => return Value::Null,
        };

        mask(&mut value, &["security", "secret_key"], |_| REDACTED.to_string());
        mask(&mut value, &["redis", "password"], |_| REDACTED.to_string());
        mask(&mut value, &["smtp", "password"], |_| REDACTED.to_string());
        for path in [
            ["database", "url"],
            ["database", "async_url"],
            ["redis", "url"],
            ["tasks", "broker_url"],
            ["tasks", "result_backend"],
        ] {
            mask(&mut value, &path, redact_url);
        }

        value
    }
}

/// Replace the password component of a URL with `***`. Unparsable input is returned as-is.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some(REDACTED)).is_err() {
                return raw.to_string();
            }
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

fn mask(value: &mut Value, path: &[&str], redact: impl Fn(&str) -> String) {
    let mut current = value;
    for key in path {
        match current.get_mut(*key) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::String(text) = current {
        let masked = redact(text.as_str());
        *text = masked;
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Typed access to env variables; every error names the variable
struct FieldReader<'a> {
    env: &'a EnvVars,
}

impl FieldReader<'_> {
    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.env.get(key).map(str::to_string)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.optional_parse(key)?.unwrap_or(default))
    }

    fn optional_parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.env
            .get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|err| ConfigError::validation(key, format!("'{raw}': {err}")))
            })
            .transpose()
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.env.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                ConfigError::validation(key, format!("'{raw}' is not a boolean"))
            }),
        }
    }

    fn list(&self, key: &str, default: &[&str]) -> Result<Vec<String>> {
        match self.optional(key) {
            None => Ok(default.iter().map(|s| s.to_string()).collect()),
            Some(raw) => derive::parse_list(ListInput::Text(raw))
                .map_err(|reason| ConfigError::validation(key, reason)),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|err| ConfigError::validation(field, format!("'{raw}': {err}")))
}

fn require_host(field: &str, raw: &str, url: &Url) -> Result<()> {
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::validation(field, format!("'{raw}': missing host")));
    }
    Ok(())
}

fn validate_postgres_dsn(field: &str, raw: &str) -> Result<()> {
    let url = parse_url(field, raw)?;
    let base = url.scheme().split('+').next().unwrap_or_default();
    if !matches!(base, "postgres" | "postgresql") {
        return Err(ConfigError::validation(
            field,
            format!("scheme '{}' is not a postgres scheme", url.scheme()),
        ));
    }
    require_host(field, raw, &url)
}

fn validate_redis_dsn(field: &str, raw: &str) -> Result<()> {
    let url = parse_url(field, raw)?;
    if !matches!(url.scheme(), "redis" | "rediss") {
        return Err(ConfigError::validation(
            field,
            format!("scheme '{}' is not a redis scheme", url.scheme()),
        ));
    }
    require_host(field, raw, &url)
}

fn validate_http_url(field: &str, raw: &str) -> Result<()> {
    let url = parse_url(field, raw)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::validation(
            field,
            format!("'{raw}' is not an http(s) URL"),
        ));
    }
    require_host(field, raw, &url)
}
