//! Error types for dashboard-db

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::schema::SchemaOperation;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// The configured URL could not be turned into connection options
    #[error("Invalid database URL: {source}")]
    InvalidUrl {
        #[source]
        source: sqlx::Error,
    },

    /// No connection could be borrowed: pool exhausted past the acquire timeout,
    /// backend unreachable, or pool closed
    #[error("Database connection error: {source}")]
    Connection {
        #[source]
        source: sqlx::Error,
    },

    /// A statement issued through a session failed
    #[error("Query failed: {source}")]
    Query {
        #[source]
        source: sqlx::Error,
    },

    /// Commit or rollback itself failed
    #[error("Transaction {operation} failed: {source}")]
    Transaction {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Create/drop of the registered schema failed; the enclosing transaction was rolled back
    #[error("Failed to {operation} schema{}: {source}", entity_suffix(.entity))]
    Schema {
        operation: SchemaOperation,
        entity: Option<String>,
        #[source]
        source: Box<DbError>,
    },

    /// Schema definitions could not be read from disk
    #[error("Failed to load schema definitions from {path:?}: {reason}")]
    SchemaSource { path: PathBuf, reason: String },

    /// The session already reached `Closed`
    #[error("Session {id} is closed")]
    SessionClosed { id: Uuid },
}

fn entity_suffix(entity: &Option<String>) -> String {
    entity
        .as_ref()
        .map(|name| format!(" at entity '{name}'"))
        .unwrap_or_default()
}

impl DbError {
    pub fn invalid_url(source: sqlx::Error) -> Self {
        Self::InvalidUrl { source }
    }

    pub fn connection(source: sqlx::Error) -> Self {
        Self::Connection { source }
    }

    pub fn query(source: sqlx::Error) -> Self {
        Self::Query { source }
    }

    pub fn transaction(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Transaction { operation, source }
    }

    pub fn schema(operation: SchemaOperation, entity: Option<&str>, source: DbError) -> Self {
        Self::Schema {
            operation,
            entity: entity.map(str::to_string),
            source: Box::new(source),
        }
    }

    pub fn schema_source(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SchemaSource {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when a borrow waited out the acquire timeout
    pub fn is_pool_timeout(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                source: sqlx::Error::PoolTimedOut
            }
        )
    }
}
