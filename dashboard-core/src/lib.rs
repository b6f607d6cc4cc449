//! dashboard-core: configuration snapshot for the analytics dashboard backend
//!
//! The snapshot is built once at process start from environment variables and an
//! optional `.env` file, then passed by reference to every component that needs it.
//!
//! ```ignore
//! let settings = dashboard_core::Settings::load()?;
//! println!("{}", settings.database.async_url);
//! ```

pub mod derive;
pub mod env;
pub mod error;
pub mod settings;

pub use env::EnvVars;
pub use error::{ConfigError, Result};
pub use settings::{
    redact_url, CacheSettings, DatabaseSettings, LoggingSettings, MetricsSettings,
    ProjectSettings, RateLimitSettings, RedisSettings, SecuritySettings, Settings, SmtpSettings,
    TaskQueueSettings, UploadSettings, WebSocketSettings, TEST_ENVIRONMENT,
};
