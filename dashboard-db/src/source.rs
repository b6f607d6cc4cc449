//! The seam between the session lifecycle and the driver.
//!
//! [`ConnectionSource`] hands out transactions on borrowed connections and
//! [`TransactionHandle`] finishes them. Production code uses the sqlx
//! implementations for `PgPool`; tests substitute an in-memory source.

use async_trait::async_trait;
use sqlx::{PgPool, Pool, Postgres, Transaction};

/// Something that can lend a connection with an open transaction on it
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Transaction: TransactionHandle;

    /// Borrow a connection and begin a transaction. May wait for a free slot.
    async fn begin(&self) -> Result<Self::Transaction, sqlx::Error>;

    /// Stop lending connections and close idle ones
    async fn close(&self) {}
}

/// An open transaction. Dropping it without `commit`/`rollback` must roll back and
/// return the connection.
#[async_trait]
pub trait TransactionHandle: Send + 'static {
    /// Run one or more SQL statements, returning rows affected
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error>;

    async fn commit(self) -> Result<(), sqlx::Error>;

    async fn rollback(self) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl ConnectionSource for PgPool {
    type Transaction = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, sqlx::Error> {
        Pool::begin(self).await
    }

    async fn close(&self) {
        Pool::close(self).await
    }
}

// sqlx queues a ROLLBACK when a Transaction is dropped unfinished and flushes it
// before the connection goes back to the pool.
#[async_trait]
impl TransactionHandle for Transaction<'static, Postgres> {
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let conn: &mut sqlx::PgConnection = &mut *self;
        let result = sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), sqlx::Error> {
        Transaction::commit(self).await
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        Transaction::rollback(self).await
    }
}
