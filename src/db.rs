//! Pooled SQLite store handle.
//!
//! One process, one writer at a time per connection. Connections are opened
//! eagerly (pool size 10) so that shared-cache in-memory databases stay
//! alive for the lifetime of the pool.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! `PRAGMA integrity_check` runs at open; returns an error if it fails.
//! `PRAGMA foreign_keys=1` is re-applied on every acquisition.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Row};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::schema;

const POOL_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot open database: {0}")]
    Open(#[source] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("cannot migrate sql schema: {0}")]
    Migrate(#[from] schema::MigrateError),
}

struct DbInner {
    sem: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
}

/// Handle to the store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Open (or create) the file-backed store at `path` and bring its
    /// schema up to date.
    pub fn open(path: &str) -> Result<Self, DbError> {
        let uri = format!("file:{path}?cache=shared");
        Self::open_uri(&uri)
    }

    /// A fresh, isolated in-memory store. Every call gets its own database,
    /// so concurrent tests never share state.
    pub fn scratch() -> Self {
        static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:rfsentry-scratch-{n}?mode=memory&cache=shared");
        match Self::open_uri(&uri) {
            Ok(db) => db,
            Err(e) => panic!("cannot open scratch database: {e}"),
        }
    }

    fn open_uri(uri: &str) -> Result<Self, DbError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_SHARED_CACHE;
        let mut conns = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            let conn = Connection::open_with_flags(uri, flags).map_err(DbError::Open)?;
            apply_pragmas(&conn).map_err(DbError::Open)?;
            conns.push(conn);
        }
        run_integrity_check(&conns[0])?;
        schema::migrate(&conns[0])?;
        Ok(Db {
            inner: Arc::new(DbInner {
                sem: Arc::new(Semaphore::new(POOL_SIZE)),
                idle: Mutex::new(conns),
            }),
        })
    }

    /// Check a connection out of the pool.
    ///
    /// Returns `None` if `cancel` fires while waiting for a free slot; the
    /// caller should treat that as a clean shutdown, not an error.
    pub async fn conn(&self, cancel: &CancellationToken) -> Option<PooledConn> {
        let sem = Arc::clone(&self.inner.sem);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = sem.acquire_owned() => permit.ok()?,
        };
        let conn = self
            .inner
            .idle
            .lock()
            .expect("connection pool lock poisoned")
            .pop()
            .expect("semaphore permit without an idle connection");
        // re-applied on every acquisition; the pool does not distinguish
        // new connections from reused ones
        conn.execute_batch("PRAGMA foreign_keys=1;")
            .expect("PRAGMA foreign_keys on a pooled connection");
        Some(PooledConn {
            conn: Some(conn),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

/// A pool checkout. Derefs to [`rusqlite::Connection`]; the connection goes
/// back to the pool on drop.
pub struct PooledConn {
    conn: Option<Connection>,
    inner: Arc<DbInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner
                .idle
                .lock()
                .expect("connection pool lock poisoned")
                .push(conn);
        }
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )
}

fn run_integrity_check(conn: &Connection) -> Result<(), DbError> {
    let result: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .map_err(DbError::Open)?;
    if result != "ok" {
        return Err(DbError::IntegrityCheckFailed(result));
    }
    Ok(())
}

/// Run `body` inside a savepoint named `name`.
///
/// The savepoint is released when `body` succeeds and rolled back (then
/// released) when it errors, so a failed body leaves no partial writes.
/// `name` must be a plain identifier; nesting requires distinct names.
pub fn savepoint<T, E>(
    conn: &Connection,
    name: &str,
    body: impl FnOnce() -> Result<T, E>,
) -> Result<T, E>
where
    E: From<rusqlite::Error>,
{
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match body() {
        Ok(v) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(v)
        }
        Err(e) => {
            // keep the body's error even if the rollback itself fails
            let _ = conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"));
            Err(e)
        }
    }
}

#[derive(Debug, Error)]
pub enum ColumnError {
    #[error("reading column: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("bad time in database: column {column}={value:?}")]
    BadTime { column: String, value: String },
}

/// Format a timestamp for storage and bind parameters.
///
/// Fixed-width UTC RFC 3339 with nanoseconds and a `Z` suffix, so the stored
/// text sorts chronologically and window comparisons can be done in SQL.
pub fn time_to_sql(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Extract an RFC 3339 timestamp from a query result column.
pub fn get_time(row: &Row<'_>, column: &str) -> Result<DateTime<Utc>, ColumnError> {
    let value: String = row.get(column)?;
    match DateTime::parse_from_rfc3339(&value) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(_) => Err(ColumnError::BadTime {
            column: column.to_owned(),
            value,
        }),
    }
}
