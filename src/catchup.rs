//! Log-oriented incremental processing on top of SQLite.
//!
//! Rows from an append-only source table are driven through a user function,
//! with a per-consumer cursor persisted in the `catchup` table. Each row's
//! side effects and its cursor update happen inside one savepoint, so a row
//! is either fully applied or not at all.
//!
//! Source table rules:
//!
//! 1. Rows may be deleted, but consumers are not notified; deleting rows
//!    with id <= the minimum cursor across all consumers is safe.
//! 2. Rows may be updated, but consumers are not notified; only columns not
//!    read by consumers are good candidates.
//! 3. Sources that ever see deletes must use AUTOINCREMENT so ids stay
//!    monotone and are never reused.
//!
//! The destination table and the cursor must live in the same database and
//! be written through the same connection, or the savepoint cannot protect
//! them together.

use rusqlite::{Connection, Row, named_params};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::{self, Db};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const LOAD_CURSOR: &str = "
SELECT ifnull((SELECT last FROM catchup WHERE name = @name), 0) AS last
";

const SAVE_CURSOR: &str = "
INSERT INTO catchup (name, last) VALUES (@name, @last)
ON CONFLICT (name) DO UPDATE SET last = excluded.last
";

pub struct Config {
    pub db: Db,
    /// Consumer name; keys the persisted cursor row.
    pub name: &'static str,
    /// Query for the maximum id in the source table. The result must have a
    /// column named `max`; NULL means the source is empty.
    pub max_sql: &'static str,
    /// Query for the next batch of source rows. The result must have a
    /// column named `id` and should use bind parameters `@last` and `@max`
    /// to limit the rows, in ascending id order.
    pub next_sql: &'static str,
}

/// How a [`Catchup::run`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No progress was made in a full pass; the cursor is at the source tail.
    CaughtUp,
    /// The cancellation token fired; state is untouched beyond the last
    /// released savepoint.
    Cancelled,
}

#[derive(Debug, Error)]
#[error("catchup {name}: {source}")]
pub struct CatchupError {
    name: &'static str,
    #[source]
    source: PassError,
}

#[derive(Debug, Error)]
enum PassError {
    #[error("fetching max id: {0}")]
    FetchMax(#[source] rusqlite::Error),
    #[error("fetching last processed id: {0}")]
    LoadCursor(#[source] rusqlite::Error),
    #[error("reading source rows: {0}")]
    Next(#[source] rusqlite::Error),
    #[error("savepoint: {0}")]
    Savepoint(#[from] rusqlite::Error),
    #[error("row {id}: error from user function: {source}")]
    Row {
        id: i64,
        #[source]
        source: BoxError,
    },
    #[error("row {id}: saving last processed id: {source}")]
    SaveCursor {
        id: i64,
        #[source]
        source: rusqlite::Error,
    },
}

pub struct Catchup {
    conf: Config,
}

impl Catchup {
    pub fn new(conf: Config) -> Self {
        Catchup { conf }
    }

    /// Drive `f` over unprocessed source rows until caught up or cancelled.
    ///
    /// `f` may be invoked more than once for the same row; all side effects
    /// must happen through the supplied connection, or be idempotent.
    /// Shared-cache lock contention (`SQLITE_LOCKED`) is retried
    /// indefinitely; any other error aborts the pass and is returned wrapped
    /// with the consumer name.
    pub async fn run<F>(
        &self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<RunStatus, CatchupError>
    where
        F: FnMut(&Connection, &Row<'_>) -> Result<(), BoxError>,
    {
        loop {
            match self.pass(cancel, &mut f).await {
                Ok(None) => return Ok(RunStatus::Cancelled),
                Ok(Some(true)) => {}
                Ok(Some(false)) => return Ok(RunStatus::CaughtUp),
                Err(e) if sqlite_locked(&e) => {
                    debug!(consumer = self.conf.name, error = %e, "retry.sqlite_deadlock");
                }
                Err(source) => {
                    return Err(CatchupError {
                        name: self.conf.name,
                        source,
                    });
                }
            }
        }
    }

    /// One pass over the source window frozen at entry.
    ///
    /// Returns `None` when cancelled during connection acquisition, else
    /// whether any row was processed.
    async fn pass<F>(
        &self,
        cancel: &CancellationToken,
        f: &mut F,
    ) -> Result<Option<bool>, PassError>
    where
        F: FnMut(&Connection, &Row<'_>) -> Result<(), BoxError>,
    {
        let Some(conn) = self.conf.db.conn(cancel).await else {
            return Ok(None);
        };

        // the window is frozen at the current max; rows arriving during
        // the pass wait for the next one
        let max: Option<i64> = conn
            .query_row(self.conf.max_sql, [], |row| row.get("max"))
            .map_err(PassError::FetchMax)?;
        let Some(max) = max else {
            // source table is empty
            return Ok(Some(false));
        };

        let last: i64 = conn
            .query_row(LOAD_CURSOR, named_params! {"@name": self.conf.name}, |row| {
                row.get("last")
            })
            .map_err(PassError::LoadCursor)?;

        let mut progress = false;
        let mut stmt = conn.prepare(self.conf.next_sql).map_err(PassError::Next)?;
        let mut rows = stmt
            .query(named_params! {"@last": last, "@max": max})
            .map_err(PassError::Next)?;
        while let Some(row) = rows.next().map_err(PassError::Next)? {
            let id: i64 = row.get("id").map_err(PassError::Next)?;
            self.run_row(&conn, f, row, id)?;
            progress = true;
        }
        Ok(Some(progress))
    }

    fn run_row<F>(
        &self,
        conn: &Connection,
        f: &mut F,
        row: &Row<'_>,
        id: i64,
    ) -> Result<(), PassError>
    where
        F: FnMut(&Connection, &Row<'_>) -> Result<(), BoxError>,
    {
        db::savepoint(conn, "catchup_row", || {
            f(conn, row).map_err(|source| PassError::Row { id, source })?;
            conn.execute(
                SAVE_CURSOR,
                named_params! {"@name": self.conf.name, "@last": id},
            )
            .map_err(|source| PassError::SaveCursor { id, source })?;
            Ok(())
        })
    }
}

/// Whether any error in the chain is SQLite's shared-cache lock conflict.
fn sqlite_locked(err: &PassError) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(rusqlite::Error::SqliteFailure(ffi_err, _)) =
            e.downcast_ref::<rusqlite::Error>()
            && ffi_err.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return true;
        }
        cur = e.source();
    }
    false
}
