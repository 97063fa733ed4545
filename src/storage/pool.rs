//! Fixed-size pool of long-lived SQLite connections.
//!
//! Every connection gets the engine pragmas and the schema on creation.
//! Acquisition is gated by a semaphore; the guard returns the connection on
//! drop, so release happens on every exit path including panics and early
//! returns.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::storage::schema::{PRAGMA_SQL, SCHEMA_SQL};

struct PoolInner {
    connections: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    size: usize,
}

impl ConnectionPool {
    /// Open (creating if needed) the database file with `size` pooled
    /// connections. The first connection initialises the schema; all of
    /// them get the pragmas.
    pub fn open(path: &Path, size: usize) -> Result<Self> {
        let size = size.max(1);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let mut connections = Vec::with_capacity(size);
        for i in 0..size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("failed to open database at {}", path.display()))?;
            Self::prepare_connection(&conn, i == 0)?;
            connections.push(conn);
        }
        debug!("connection pool ready: {} connections at {}", size, path.display());

        Ok(Self {
            inner: Arc::new(PoolInner {
                connections: Mutex::new(connections),
                permits: Arc::new(Semaphore::new(size)),
            }),
            size,
        })
    }

    /// Single-connection in-memory pool for tests. In-memory databases are
    /// per-connection, so the pool size is pinned to one.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::prepare_connection(&conn, true)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connections: Mutex::new(vec![conn]),
                permits: Arc::new(Semaphore::new(1)),
            }),
            size: 1,
        })
    }

    fn prepare_connection(conn: &Connection, init_schema: bool) -> Result<()> {
        conn.execute_batch(PRAGMA_SQL)
            .context("failed to apply engine pragmas")?;
        if init_schema {
            conn.execute_batch(SCHEMA_SQL)
                .context("failed to initialise schema")?;
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap_or_default();
            if !journal_mode.eq_ignore_ascii_case("wal")
                && !journal_mode.eq_ignore_ascii_case("memory")
            {
                warn!("WAL mode not active, journal_mode = {journal_mode}");
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free connection.
    pub async fn acquire(&self) -> PooledConn {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");
        let conn = self
            .inner
            .connections
            .lock()
            .pop()
            .expect("permit guarantees an available connection");
        PooledConn {
            conn: Some(conn),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Blocking façade over the same pool for synchronous callers.
    pub fn acquire_blocking(&self) -> PooledConn {
        let permit = loop {
            match self.inner.permits.clone().try_acquire_owned() {
                Ok(permit) => break permit,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        };
        let conn = self
            .inner
            .connections
            .lock()
            .pop()
            .expect("permit guarantees an available connection");
        PooledConn {
            conn: Some(conn),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConn {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.connections.lock().push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connections_cycle_through_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("test.db"), 2).unwrap();
        assert_eq!(pool.size(), 2);

        let a = pool.acquire().await;
        let b = pool.acquire().await;
        a.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        drop(a);
        drop(b);

        let c = pool.acquire().await;
        let count: i64 = c
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 't'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn schema_tables_exist_after_open() {
        let pool = ConnectionPool::in_memory().unwrap();
        let conn = pool.acquire().await;
        for table in ["market_data", "funding_rate", "open_interest", "long_short_ratio"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn blocking_facade_acquires_and_releases() {
        let pool = ConnectionPool::in_memory().unwrap();
        {
            let conn = pool.acquire_blocking();
            conn.execute("INSERT INTO funding_rate (symbol, timestamp) VALUES ('X', 1)", [])
                .unwrap();
        }
        let conn = pool.acquire_blocking();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM funding_rate", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
