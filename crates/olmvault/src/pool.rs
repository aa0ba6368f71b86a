//! Connection Manager.
//!
//! A bounded pool of backend connections built on `r2d2`. Pools are created
//! lazily (no connection is opened at construction), so building a store
//! never fails because the backend is down; the first `acquire` or `probe`
//! finds out.

use std::time::Duration;

use r2d2::{ManageConnection, Pool, PooledConnection};
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;

use crate::{config::PoolSettings, error::StoreError};

/// A pooled connection. Returned to the pool when dropped.
pub type Handle<B> = PooledConnection<B>;

/// A backend the Connection Manager can pool.
pub trait Backend: ManageConnection {
    /// Backend label for logs
    const NAME: &'static str;

    /// Cheap round trip proving the connection is usable.
    fn ping(conn: &mut Self::Connection) -> Result<(), StoreError>;
}

impl Backend for SqliteConnectionManager {
    const NAME: &'static str = "sqlite";

    fn ping(conn: &mut Self::Connection) -> Result<(), StoreError> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| StoreError::Unavailable(format!("sqlite ping failed: {e}")))
    }
}

impl Backend for PostgresConnectionManager<NoTls> {
    const NAME: &'static str = "postgres";

    fn ping(conn: &mut Self::Connection) -> Result<(), StoreError> {
        conn.batch_execute("SELECT 1")
            .map_err(|e| StoreError::Unavailable(format!("postgres ping failed: {e}")))
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections
    pub connections: u32,
    /// Open connections not checked out
    pub idle: u32,
    /// Upper bound on open connections
    pub max_size: u32,
}

impl PoolStatus {
    /// Connections currently checked out.
    pub fn in_use(&self) -> u32 {
        self.connections.saturating_sub(self.idle)
    }
}

/// Bounded connection pool for one backend.
///
/// Clones share the same pool.
pub struct ConnectionManager<B: Backend> {
    pool: Pool<B>,
    acquire_timeout: Duration,
}

impl<B: Backend> Clone for ConnectionManager<B> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), acquire_timeout: self.acquire_timeout }
    }
}

impl<B: Backend> ConnectionManager<B> {
    /// Build a pool without opening any connection.
    pub fn new(manager: B, settings: PoolSettings) -> Self {
        let acquire_timeout = settings.acquire_timeout.max(Duration::from_millis(1));
        let pool = Pool::builder()
            .max_size(settings.max_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(acquire_timeout)
            .test_on_check_out(true)
            .build_unchecked(manager);
        Self { pool, acquire_timeout }
    }

    /// Borrow a connection, waiting at most the configured acquire timeout.
    ///
    /// Pool exhaustion and connect failures both surface as
    /// [`StoreError::Unavailable`].
    pub fn acquire(&self) -> Result<Handle<B>, StoreError> {
        self.pool.get_timeout(self.acquire_timeout).map_err(|e| {
            StoreError::Unavailable(format!("{} connection unavailable: {e}", B::NAME))
        })
    }

    /// Return a connection to the pool.
    pub fn release(&self, handle: Handle<B>) {
        drop(handle);
    }

    /// Whether a connection can be acquired and answers a trivial query.
    pub fn probe(&self) -> bool {
        self.check().is_ok()
    }

    /// Like [`probe`](Self::probe) but keeps the failure reason.
    pub fn check(&self) -> Result<(), StoreError> {
        let mut handle = self.acquire()?;
        let result = B::ping(&mut *handle);
        self.release(handle);
        result
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle: state.idle_connections,
            max_size: self.pool.max_size(),
        }
    }
}
