//! Database connection pool management
//!
//! Builds a lazy sqlx `PgPool` from the settings snapshot. The pool has a single tier,
//! so the configured base size and overflow are added together into `max_connections`.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashboard_core::derive::strip_driver;
use dashboard_core::Settings;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};

/// What happens to a connection when a session gives it back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolDiscipline {
    /// Keep it idle for reuse; borrowers beyond the limit wait in line
    Queue,
    /// Close it immediately, so each session opens a fresh connection. Concurrent
    /// connections stay capped at `max_connections`.
    NoPool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    pub pool_size: u32,
    pub max_overflow: u32,
    pub recycle: Duration,
    pub pre_ping: bool,
    pub acquire_timeout: Duration,
    pub discipline: PoolDiscipline,
}

impl PoolSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        let db = &settings.database;
        Self {
            pool_size: db.pool_size,
            max_overflow: db.max_overflow,
            recycle: db.pool_recycle(),
            pre_ping: db.pool_pre_ping,
            acquire_timeout: db.pool_timeout(),
            discipline: if settings.is_test() {
                PoolDiscipline::NoPool
            } else {
                PoolDiscipline::Queue
            },
        }
    }

    /// Upper bound on concurrently borrowed connections
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }
}

/// Fires the first-connect hook exactly once per engine
#[derive(Debug, Clone, Default)]
pub struct FirstConnect(Arc<AtomicBool>);

impl FirstConnect {
    /// Record a new physical connection. Returns true only for the first one.
    pub fn observe(&self) -> bool {
        let first = !self.0.swap(true, Ordering::AcqRel);
        if first {
            info!("Database first connection established");
        }
        first
    }

    pub fn has_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Parse the URL into connect options. The `+asyncpg` driver token is accepted and dropped.
pub fn connect_options(url: &str, log_statements: bool) -> DbResult<PgConnectOptions> {
    let options = PgConnectOptions::from_str(&strip_driver(url)).map_err(DbError::invalid_url)?;
    Ok(if log_statements {
        options
    } else {
        options.disable_statement_logging()
    })
}

pub fn pool_options(settings: &PoolSettings, first_connect: FirstConnect) -> PgPoolOptions {
    let options = PgPoolOptions::new()
        .max_connections(settings.max_connections())
        .min_connections(0)
        .acquire_timeout(settings.acquire_timeout)
        .max_lifetime(settings.recycle)
        .test_before_acquire(settings.pre_ping)
        .after_connect(move |_conn, _meta| {
            first_connect.observe();
            Box::pin(async { Ok(()) })
        });

    match settings.discipline {
        PoolDiscipline::Queue => options,
        PoolDiscipline::NoPool => options.after_release(|_conn, _meta| {
            debug!("closing released connection");
            Box::pin(async { Ok(false) })
        }),
    }
}

/// Create the pool without opening any connection
pub fn create_pool(
    url: &str,
    settings: &PoolSettings,
    log_statements: bool,
    first_connect: FirstConnect,
) -> DbResult<PgPool> {
    let connect = connect_options(url, log_statements)?;
    let pool = pool_options(settings, first_connect).connect_lazy_with(connect);

    info!(
        max_connections = settings.max_connections(),
        discipline = ?settings.discipline,
        "database pool configured"
    );
    Ok(pool)
}
