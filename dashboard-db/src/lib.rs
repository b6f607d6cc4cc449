//! dashboard-db: connection pool and scoped session lifecycle
//!
//! The [`Engine`] owns a single PostgreSQL pool sized from the settings snapshot. Work
//! happens inside [`Engine::acquire_session`], which commits on success, rolls back on
//! error, and always returns the connection to the pool.
//!
//! ```ignore
//! let settings = dashboard_core::Settings::load()?;
//! let engine = dashboard_db::Engine::initialize(&settings, SchemaRegistry::from_dir("schema")?)?;
//! engine.create_schema().await?;
//! ```

pub mod engine;
pub mod error;
pub mod pool;
pub mod schema;
pub mod session;
pub mod source;

#[cfg(test)]
mod mock;

pub use engine::Engine;
pub use error::{DbError, DbResult};
pub use futures::future::BoxFuture;
pub use pool::{FirstConnect, PoolDiscipline, PoolSettings};
pub use schema::{EntityDefinition, SchemaOperation, SchemaRegistry, SchemaStatement};
pub use session::{Session, SessionCache, SessionState, SessionStats};
pub use source::{ConnectionSource, TransactionHandle};
