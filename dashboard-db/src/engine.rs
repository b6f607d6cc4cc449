//! The database engine: one pool, scoped sessions, schema management.

use std::fmt;
use std::sync::Arc;

use dashboard_core::Settings;
use futures::future::BoxFuture;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::error::{DbError, DbResult};
use crate::pool::{self, FirstConnect, PoolSettings};
use crate::schema::{SchemaOperation, SchemaRegistry};
use crate::session::{Session, SessionCounters, SessionStats};
use crate::source::ConnectionSource;

/// Shared handle to the pool. Cloning is cheap; every clone uses the same pool.
pub struct Engine<S: ConnectionSource = PgPool> {
    inner: Arc<EngineInner<S>>,
}

struct EngineInner<S> {
    source: S,
    pool_settings: PoolSettings,
    registry: SchemaRegistry,
    counters: Arc<SessionCounters>,
    first_connect: FirstConnect,
}

impl<S: ConnectionSource> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine<PgPool> {
    /// Build the engine from the settings snapshot.
    ///
    /// No connection is opened here; the first one is made when a session needs it.
    /// Must be called from within a Tokio runtime.
    pub fn initialize(settings: &Settings, registry: SchemaRegistry) -> DbResult<Self> {
        let pool_settings = PoolSettings::from_settings(settings);
        let first_connect = FirstConnect::default();
        let pool = pool::create_pool(
            &settings.database.async_url,
            &pool_settings,
            settings.debug,
            first_connect.clone(),
        )?;

        Ok(Self::with_source(pool, pool_settings, registry, first_connect))
    }

    pub fn pool(&self) -> &PgPool {
        &self.inner.source
    }
}

impl<S: ConnectionSource> Engine<S> {
    /// Build an engine over any connection source. `first_connect` must be the hook the
    /// source fires when it opens a physical connection; the engine only reads it.
    pub fn with_source(
        source: S,
        pool_settings: PoolSettings,
        registry: SchemaRegistry,
        first_connect: FirstConnect,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                source,
                pool_settings,
                registry,
                counters: Arc::new(SessionCounters::default()),
                first_connect,
            }),
        }
    }

    /// Run `body` inside a fresh session and transaction.
    ///
    /// Commits when `body` returns `Ok`. On `Err` the error is logged, the transaction
    /// rolled back, and the same error returned. If the returned future is dropped or
    /// `body` panics, the session rolls back and closes as it is dropped.
    ///
    /// Waits for a free connection when the pool is saturated, up to the acquire timeout.
    ///
    /// ```ignore
    /// let rows = engine
    ///     .acquire_session(|session| Box::pin(async move {
    ///         session.execute("UPDATE widgets SET stale = true").await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn acquire_session<F, R, E>(&self, body: F) -> Result<R, E>
    where
        F: for<'s> FnOnce(&'s mut Session<S::Transaction>) -> BoxFuture<'s, Result<R, E>> + Send,
        R: Send,
        E: From<DbError> + fmt::Display + Send,
    {
        let mut session = self.open_session().await?;

        match body(&mut session).await {
            Ok(value) => {
                if let Err(err) = session.commit().await {
                    error!(session = %session.id(), error = %err, "session commit failed");
                    return Err(err.into());
                }
                Ok(value)
            }
            Err(err) => {
                error!(session = %session.id(), error = %err, "session failed, rolling back");
                if let Err(rollback_err) = session.rollback().await {
                    warn!(session = %session.id(), error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn open_session(&self) -> DbResult<Session<S::Transaction>> {
        let tx = self.inner.source.begin().await.map_err(|source| {
            let err = DbError::connection(source);
            warn!(error = %err, "could not borrow a connection");
            err
        })?;
        Ok(Session::open(tx, Arc::clone(&self.inner.counters)))
    }

    /// Create every registered entity in one transaction
    pub async fn create_schema(&self) -> DbResult<()> {
        self.apply_schema(SchemaOperation::Create).await
    }

    /// Drop every registered entity in one transaction, in reverse order
    pub async fn drop_schema(&self) -> DbResult<()> {
        self.apply_schema(SchemaOperation::Drop).await
    }

    async fn apply_schema(&self, operation: SchemaOperation) -> DbResult<()> {
        let statements = self.inner.registry.statements(operation);
        let count = statements.len();

        let result = self
            .acquire_session::<_, _, DbError>(move |session| {
                Box::pin(async move {
                    for statement in &statements {
                        debug!(entity = %statement.entity, %operation, "applying schema statement");
                        session.execute(&statement.sql).await.map_err(|err| {
                            DbError::schema(operation, Some(&statement.entity), err)
                        })?;
                    }
                    Ok(())
                })
            })
            .await
            .map_err(|err| match err {
                DbError::Schema { .. } => err,
                other => DbError::schema(operation, None, other),
            });

        match &result {
            Ok(()) => match operation {
                SchemaOperation::Create => {
                    info!(entities = count, "Database tables created successfully")
                }
                SchemaOperation::Drop => {
                    info!(entities = count, "Database tables dropped successfully")
                }
            },
            Err(err) => error!(%operation, error = %err, "Error applying database schema"),
        }
        result
    }

    /// Round-trip `SELECT 1` through a scoped session
    pub async fn ping(&self) -> DbResult<()> {
        self.acquire_session::<_, _, DbError>(|session| {
            Box::pin(async move { session.execute("SELECT 1").await.map(|_| ()) })
        })
        .await
    }

    /// Stop lending connections and close idle ones. Borrowed connections close on return.
    pub async fn close(&self) {
        self.inner.source.close().await;
        info!("database engine closed");
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    /// Whether any physical connection has been opened yet
    pub fn has_connected(&self) -> bool {
        self.inner.first_connect.has_fired()
    }

    pub fn pool_settings(&self) -> &PoolSettings {
        &self.inner.pool_settings
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }
}

impl<S: ConnectionSource> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("pool_settings", &self.inner.pool_settings)
            .field("entities", &self.inner.registry.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{Event, MockSource, MockTransaction};
    use crate::pool::PoolDiscipline;
    use crate::schema::EntityDefinition;
    use tokio::sync::{oneshot, Semaphore};

    #[derive(Debug, thiserror::Error)]
    enum WidgetError {
        #[error("widget {0} not found")]
        NotFound(u32),
        #[error(transparent)]
        Db(#[from] DbError),
    }

    fn pool_settings(slots: u32) -> PoolSettings {
        PoolSettings {
            pool_size: slots,
            max_overflow: 0,
            recycle: Duration::from_secs(300),
            pre_ping: true,
            acquire_timeout: Duration::from_secs(30),
            discipline: PoolDiscipline::Queue,
        }
    }

    fn engine(slots: u32, registry: SchemaRegistry) -> (Engine<MockSource>, MockSource) {
        let source = MockSource::new(slots as usize);
        let engine = Engine::with_source(
            source.clone(),
            pool_settings(slots),
            registry,
            source.first_connect(),
        );
        (engine, source)
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                EntityDefinition::new("users")
                    .on_create("CREATE TABLE users (id UUID PRIMARY KEY)")
                    .on_drop("DROP TABLE users"),
            )
            .with(
                EntityDefinition::new("dashboards")
                    .on_create("CREATE TABLE dashboards (owner UUID REFERENCES users(id))")
                    .on_drop("DROP TABLE dashboards"),
            )
    }

    fn explode(session: &mut Session<MockTransaction>) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move {
            session.cache_mut().insert("pending".into(), serde_json::json!(true));
            if session.cache().is_some() {
                panic!("widget renderer exploded");
            }
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_ok_body_commits_and_closes() {
        let (engine, source) = engine(1, SchemaRegistry::new());

        let rows = engine
            .acquire_session::<_, _, DbError>(|session| {
                Box::pin(async move {
                    session.cache_mut().insert("k".into(), serde_json::json!(1));
                    session.execute("UPDATE widgets SET stale = true").await
                })
            })
            .await
            .unwrap();

        assert_eq!(rows, 1);
        assert_eq!(
            source.events(),
            vec![
                Event::Begin(1),
                Event::Execute(1, "UPDATE widgets SET stale = true".into()),
                Event::Commit(1),
                Event::Release(1),
            ]
        );
        let stats = engine.stats();
        assert_eq!((stats.opened, stats.committed, stats.closed), (1, 1, 1));
        assert_eq!(stats.active(), 0);
        assert_eq!(source.available(), 1);
    }

    #[tokio::test]
    async fn test_body_error_rolls_back_and_passes_through() {
        let (engine, source) = engine(1, SchemaRegistry::new());

        let err = engine
            .acquire_session(|session| {
                Box::pin(async move {
                    session.execute("SELECT * FROM widgets WHERE id = 7").await?;
                    Err::<(), _>(WidgetError::NotFound(7))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WidgetError::NotFound(7)));
        assert_eq!(
            source.events(),
            vec![
                Event::Begin(1),
                Event::Execute(1, "SELECT * FROM widgets WHERE id = 7".into()),
                Event::Rollback(1),
                Event::Release(1),
            ]
        );
        let stats = engine.stats();
        assert_eq!((stats.rolled_back, stats.closed), (1, 1));
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back_and_releases() {
        let (engine, source) = engine(1, SchemaRegistry::new());
        let (started_tx, started_rx) = oneshot::channel();

        let task_engine = engine.clone();
        let handle = tokio::spawn(async move {
            task_engine
                .acquire_session::<_, _, DbError>(move |session| {
                    Box::pin(async move {
                        session.execute("UPDATE widgets SET x = 1").await?;
                        let _ = started_tx.send(());
                        futures::future::pending::<()>().await;
                        Ok(())
                    })
                })
                .await
        });

        started_rx.await.unwrap();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert_eq!(
            source.events(),
            vec![
                Event::Begin(1),
                Event::Execute(1, "UPDATE widgets SET x = 1".into()),
                Event::Abandon(1),
                Event::Release(1),
            ]
        );
        let stats = engine.stats();
        assert_eq!((stats.committed, stats.rolled_back, stats.closed), (0, 1, 1));
        assert_eq!(source.available(), 1);
    }

    #[tokio::test]
    async fn test_panic_in_body_rolls_back_and_releases() {
        let (engine, source) = engine(1, SchemaRegistry::new());

        let task_engine = engine.clone();
        let result = tokio::spawn(async move { task_engine.acquire_session(explode).await }).await;
        assert!(result.unwrap_err().is_panic());

        assert_eq!(
            source.events(),
            vec![Event::Begin(1), Event::Abandon(1), Event::Release(1)]
        );
        assert_eq!(engine.stats().rolled_back, 1);
        assert_eq!(engine.stats().active(), 0);
        assert_eq!(source.available(), 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_waits_instead_of_failing() {
        let (engine, source) = engine(2, SchemaRegistry::new());
        let gate = Arc::new(Semaphore::new(0));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let engine = engine.clone();
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    engine
                        .acquire_session::<_, _, DbError>(move |session| {
                            Box::pin(async move {
                                gate.acquire().await.unwrap().forget();
                                session.execute(&format!("UPDATE widgets SET n = {i}")).await
                            })
                        })
                        .await
                })
            })
            .collect();

        while source.begin_count() < 2 {
            tokio::task::yield_now().await;
        }
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        // Third session is parked waiting for a slot
        assert_eq!(source.begin_count(), 2);
        assert_eq!(source.available(), 0);

        gate.add_permits(3);
        for handle in handles {
            let rows = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("session never completed")
                .unwrap()
                .unwrap();
            assert_eq!(rows, 1);
        }

        assert_eq!(source.begin_count(), 3);
        assert_eq!(engine.stats().committed, 3);
        assert_eq!(source.available(), 2);
    }

    #[tokio::test]
    async fn test_begin_failure_is_connection_error() {
        let (engine, source) = engine(1, SchemaRegistry::new());
        source.fail_begin();

        let err = engine.ping().await.unwrap_err();
        assert!(err.is_pool_timeout());
        assert_eq!(engine.stats().opened, 0);
        assert!(!engine.has_connected());
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces() {
        let (engine, source) = engine(1, SchemaRegistry::new());
        source.fail_commits();

        let err = engine.ping().await.unwrap_err();
        assert!(matches!(err, DbError::Transaction { operation: "commit", .. }));
        assert_eq!(engine.stats().rolled_back, 1);
        assert_eq!(source.available(), 1);
    }

    #[tokio::test]
    async fn test_create_then_drop_schema_order() {
        let (engine, source) = engine(1, registry());

        engine.create_schema().await.unwrap();
        engine.drop_schema().await.unwrap();

        assert_eq!(
            source.executed(),
            vec![
                "CREATE TABLE users (id UUID PRIMARY KEY)",
                "CREATE TABLE dashboards (owner UUID REFERENCES users(id))",
                "DROP TABLE dashboards",
                "DROP TABLE users",
            ]
        );
        assert_eq!(engine.stats().committed, 2);
    }

    #[tokio::test]
    async fn test_schema_failure_names_entity_and_rolls_back() {
        let (engine, source) = engine(1, registry());
        source.fail_statements_containing("dashboards");

        let err = engine.create_schema().await.unwrap_err();
        match &err {
            DbError::Schema {
                operation, entity, ..
            } => {
                assert_eq!(*operation, SchemaOperation::Create);
                assert_eq!(entity.as_deref(), Some("dashboards"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            source.events(),
            vec![
                Event::Begin(1),
                Event::Execute(1, "CREATE TABLE users (id UUID PRIMARY KEY)".into()),
                Event::Rollback(1),
                Event::Release(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_schema_begin_failure_is_wrapped() {
        let (engine, source) = engine(1, registry());
        source.fail_begin();

        let err = engine.drop_schema().await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Schema {
                operation: SchemaOperation::Drop,
                entity: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_registry_is_a_noop_transaction() {
        let (engine, source) = engine(1, SchemaRegistry::new());
        engine.create_schema().await.unwrap();
        assert!(source.executed().is_empty());
        assert_eq!(engine.stats().committed, 1);
    }

    #[tokio::test]
    async fn test_ping_marks_connected() {
        let (engine, source) = engine(1, SchemaRegistry::new());
        assert!(!engine.has_connected());

        engine.ping().await.unwrap();
        assert!(engine.has_connected());
        assert_eq!(source.executed(), vec!["SELECT 1"]);
    }

    #[tokio::test]
    async fn test_borrowing_alone_does_not_mark_connected() {
        // The source never reports a physical connection to this hook
        let source = MockSource::new(1);
        let engine = Engine::with_source(
            source.clone(),
            pool_settings(1),
            SchemaRegistry::new(),
            FirstConnect::default(),
        );

        engine.ping().await.unwrap();
        assert_eq!(source.begin_count(), 1);
        assert!(!engine.has_connected());
    }

    #[tokio::test]
    async fn test_close_stops_lending() {
        let (engine, _source) = engine(1, SchemaRegistry::new());
        engine.close().await;

        let err = engine.ping().await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_initialize_does_not_connect() {
        let settings = Settings::from_vars([
            ("DATABASE_URL", "postgresql://u:p@127.0.0.1:1/analytics"),
            ("DB_POOL_SIZE", "4"),
            ("DB_MAX_OVERFLOW", "2"),
        ])
        .unwrap();

        let engine = Engine::initialize(&settings, registry()).unwrap();
        assert_eq!(engine.pool().size(), 0);
        assert_eq!(engine.pool().options().get_max_connections(), 6);
        assert_eq!(engine.pool_settings().discipline, PoolDiscipline::Queue);
        assert_eq!(engine.registry().len(), 2);
        assert!(!engine.has_connected());
        assert_eq!(engine.stats(), SessionStats::default());
        engine.close().await;
    }

    #[tokio::test]
    async fn test_initialize_test_environment_uses_no_pool() {
        let settings = Settings::from_vars([("ENVIRONMENT", "test")]).unwrap();
        let engine = Engine::initialize(&settings, SchemaRegistry::new()).unwrap();
        assert_eq!(engine.pool_settings().discipline, PoolDiscipline::NoPool);
        engine.close().await;
    }

    // Run with: DATABASE_URL=postgres://... cargo test -p dashboard-db -- --ignored

    #[tokio::test]
    #[ignore = "requires database"]
    async fn postgres_schema_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let settings = Settings::from_vars([("DATABASE_URL", url)]).unwrap();
        let registry = SchemaRegistry::new().with(
            EntityDefinition::new("dashboard_db_smoke")
                .on_create("CREATE TABLE dashboard_db_smoke (id INT PRIMARY KEY)")
                .on_drop("DROP TABLE IF EXISTS dashboard_db_smoke"),
        );
        let engine = Engine::initialize(&settings, registry).unwrap();

        engine.create_schema().await.expect("create failed");
        engine.ping().await.expect("ping failed");
        assert!(engine.has_connected());
        engine.drop_schema().await.expect("drop failed");
        engine.close().await;
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn postgres_body_error_rolls_back() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let settings = Settings::from_vars([("DATABASE_URL", url)]).unwrap();
        let engine = Engine::initialize(&settings, SchemaRegistry::new()).unwrap();

        let _ = engine
            .acquire_session(|session| {
                Box::pin(async move {
                    session
                        .execute("CREATE TABLE dashboard_db_rollback_check (id INT)")
                        .await?;
                    Err::<(), _>(WidgetError::NotFound(1))
                })
            })
            .await;

        // The table creation was rolled back, so creating it again succeeds
        engine
            .acquire_session::<_, _, DbError>(|session| {
                Box::pin(async move {
                    session
                        .execute("CREATE TABLE dashboard_db_rollback_check (id INT)")
                        .await?;
                    session.execute("DROP TABLE dashboard_db_rollback_check").await?;
                    Ok(())
                })
            })
            .await
            .expect("table should not exist after rollback");
        engine.close().await;
    }
}
