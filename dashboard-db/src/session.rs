//! Unit-of-work sessions.
//!
//! A session owns one transaction on one borrowed connection and moves through
//! `Created -> Active -> {Committed | RolledBack} -> Closed`. Sessions are only
//! created by [`crate::Engine::acquire_session`], which decides the outcome; the
//! `Drop` impl covers cancellation and panics so that every session reaches `Closed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::source::TransactionHandle;

/// Per-session scratch space for upstream code. Cleared whenever the transaction ends.
pub type SessionCache = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Committed,
    RolledBack,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, Committed)
                | (Active, RolledBack)
                | (Committed, Closed)
                | (RolledBack, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifetime counters shared by all sessions of one engine
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    opened: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    closed: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            opened: self.opened.load(Ordering::Acquire),
            committed: self.committed.load(Ordering::Acquire),
            rolled_back: self.rolled_back.load(Ordering::Acquire),
            closed: self.closed.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of session outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub opened: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub closed: u64,
}

impl SessionStats {
    /// Sessions opened but not yet closed
    pub fn active(&self) -> u64 {
        self.opened.saturating_sub(self.closed)
    }
}

pub struct Session<T: TransactionHandle> {
    id: Uuid,
    state: SessionState,
    tx: Option<T>,
    cache: Option<SessionCache>,
    counters: Arc<SessionCounters>,
}

impl<T: TransactionHandle> Session<T> {
    pub(crate) fn open(tx: T, counters: Arc<SessionCounters>) -> Self {
        counters.opened.fetch_add(1, Ordering::AcqRel);
        let mut session = Self {
            id: Uuid::new_v4(),
            state: SessionState::Created,
            tx: Some(tx),
            cache: None,
            counters,
        };
        session.transition(SessionState::Active);
        debug!(session = %session.id, "session opened");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The open transaction. Fails once the session has finished.
    pub fn transaction(&mut self) -> DbResult<&mut T> {
        let id = self.id;
        self.tx.as_mut().ok_or(DbError::SessionClosed { id })
    }

    /// Run raw SQL inside the session's transaction
    pub async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.transaction()?
            .execute(sql)
            .await
            .map_err(DbError::query)
    }

    pub fn cache(&self) -> Option<&SessionCache> {
        self.cache.as_ref()
    }

    /// The session cache, created on first use
    pub fn cache_mut(&mut self) -> &mut SessionCache {
        self.cache.get_or_insert_with(SessionCache::new)
    }

    /// Replace the session cache, returning the previous one
    pub fn attach_cache(&mut self, cache: SessionCache) -> Option<SessionCache> {
        self.cache.replace(cache)
    }

    pub(crate) async fn commit(&mut self) -> DbResult<()> {
        let tx = self.take_transaction()?;
        let result = tx.commit().await;
        self.end_transaction();

        match result {
            Ok(()) => {
                self.transition(SessionState::Committed);
                self.counters.committed.fetch_add(1, Ordering::AcqRel);
                self.close();
                Ok(())
            }
            Err(source) => {
                // The dropped transaction rolls back on its own
                self.transition(SessionState::RolledBack);
                self.counters.rolled_back.fetch_add(1, Ordering::AcqRel);
                self.close();
                Err(DbError::transaction("commit", source))
            }
        }
    }

    pub(crate) async fn rollback(&mut self) -> DbResult<()> {
        let tx = self.take_transaction()?;
        let result = tx.rollback().await;
        self.end_transaction();
        self.transition(SessionState::RolledBack);
        self.counters.rolled_back.fetch_add(1, Ordering::AcqRel);
        self.close();
        result.map_err(|source| DbError::transaction("rollback", source))
    }

    fn take_transaction(&mut self) -> DbResult<T> {
        let id = self.id;
        self.tx.take().ok_or(DbError::SessionClosed { id })
    }

    /// Transaction-end hook: drop whatever upstream code cached on the session
    fn end_transaction(&mut self) {
        if let Some(cache) = self.cache.take() {
            debug!(session = %self.id, entries = cache.len(), "cleared session cache");
        }
    }

    fn close(&mut self) {
        self.transition(SessionState::Closed);
        self.counters.closed.fetch_add(1, Ordering::AcqRel);
        debug!(session = %self.id, "session closed");
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }
}

impl<T: TransactionHandle> Drop for Session<T> {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        // Cancelled or panicked before an outcome was recorded. Dropping the
        // transaction rolls it back and returns the connection.
        if let Some(tx) = self.tx.take() {
            warn!(session = %self.id, "session abandoned mid-transaction, rolling back");
            drop(tx);
        }
        self.end_transaction();

        if self.state == SessionState::Active {
            self.transition(SessionState::RolledBack);
            self.counters.rolled_back.fetch_add(1, Ordering::AcqRel);
        }
        self.close();
    }
}

impl<T: TransactionHandle> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cached_entries", &self.cache.as_ref().map_or(0, HashMap::len))
            .finish()
    }
}
