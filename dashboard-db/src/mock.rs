//! In-memory connection source for exercising the session lifecycle without a database.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::pool::FirstConnect;
use crate::source::{ConnectionSource, TransactionHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin(u32),
    Execute(u32, String),
    Commit(u32),
    Rollback(u32),
    /// Dropped without commit or rollback
    Abandon(u32),
    /// Connection returned to the source
    Release(u32),
}

#[derive(Debug, Default)]
struct MockState {
    events: Vec<Event>,
    next_id: u32,
    fail_begin: bool,
    fail_commits: bool,
    fail_statements_containing: Option<String>,
}

/// A source with a fixed number of connection slots
#[derive(Debug, Clone)]
pub struct MockSource {
    permits: Arc<Semaphore>,
    state: Arc<Mutex<MockState>>,
    first_connect: FirstConnect,
}

impl MockSource {
    pub fn new(slots: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(slots)),
            state: Arc::new(Mutex::new(MockState::default())),
            first_connect: FirstConnect::default(),
        }
    }

    /// Hook fired whenever a transaction begins, standing in for a fresh physical connection
    pub fn first_connect(&self) -> FirstConnect {
        self.first_connect.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Execute(_, sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn begin_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::Begin(_)))
            .count()
    }

    /// Free connection slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn fail_begin(&self) {
        self.state.lock().unwrap().fail_begin = true;
    }

    pub fn fail_commits(&self) {
        self.state.lock().unwrap().fail_commits = true;
    }

    pub fn fail_statements_containing(&self, needle: &str) {
        self.state.lock().unwrap().fail_statements_containing = Some(needle.to_string());
    }
}

#[async_trait]
impl ConnectionSource for MockSource {
    type Transaction = MockTransaction;

    async fn begin(&self) -> Result<MockTransaction, sqlx::Error> {
        let fail_begin = self.state.lock().unwrap().fail_begin;
        if fail_begin {
            return Err(sqlx::Error::PoolTimedOut);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| sqlx::Error::PoolClosed)?;
        self.first_connect.observe();

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.events.push(Event::Begin(id));

        Ok(MockTransaction {
            id,
            finished: false,
            state: self.state.clone(),
            _permit: permit,
        })
    }

    async fn close(&self) {
        self.permits.close();
    }
}

pub struct MockTransaction {
    id: u32,
    finished: bool,
    state: Arc<Mutex<MockState>>,
    _permit: OwnedSemaphorePermit,
}

impl MockTransaction {
    fn record(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl TransactionHandle for MockTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let failing = self
            .state
            .lock()
            .unwrap()
            .fail_statements_containing
            .as_deref()
            .is_some_and(|needle| sql.contains(needle));
        if failing {
            return Err(sqlx::Error::Protocol(format!("relation in `{sql}` rejected")));
        }

        self.record(Event::Execute(self.id, sql.to_string()));
        Ok(1)
    }

    async fn commit(mut self) -> Result<(), sqlx::Error> {
        if self.state.lock().unwrap().fail_commits {
            return Err(sqlx::Error::Protocol("commit rejected".to_string()));
        }
        self.finished = true;
        self.record(Event::Commit(self.id));
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), sqlx::Error> {
        self.finished = true;
        self.record(Event::Rollback(self.id));
        Ok(())
    }
}

impl Drop for MockTransaction {
    fn drop(&mut self) {
        // Runs during unwinding in the panic tests; never panic on a poisoned lock here
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !self.finished {
            state.events.push(Event::Abandon(self.id));
        }
        state.events.push(Event::Release(self.id));
    }
}
