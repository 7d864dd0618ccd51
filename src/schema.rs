//! Forward-only schema migrations.
//!
//! Migration `k` lives at index `k - 1` of [`MIGRATIONS`] and bumps the
//! stored version to `k` inside the same savepoint, so a failed step leaves
//! the database at the previous version. A stored version ahead of the known
//! set is refused; there is no downgrade path.

use rusqlite::Connection;
use thiserror::Error;

use crate::db;

const MIGRATIONS: &[&str] = &[
    include_str!("migrations/0001_raw_log.sql"),
    include_str!("migrations/0002_honeywell5800.sql"),
];

const CREATE_SCHEMA_VERSION: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
INSERT INTO schema_version (version)
SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version);
";

const GET_SCHEMA_VERSION: &str = "SELECT version FROM schema_version";

const UPDATE_SCHEMA_VERSION: &str = "UPDATE schema_version SET version = ?1";

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("cannot read schema migration state: {0}")]
    Version(#[source] rusqlite::Error),
    #[error("schema version cannot be negative: {0}")]
    NegativeVersion(i64),
    #[error("schema version is greater than what we know: {0}")]
    VersionAhead(i64),
    #[error("migration step #{step} failed: {source}")]
    Step {
        step: usize,
        #[source]
        source: rusqlite::Error,
    },
}

/// Bring `conn`'s database up to the current schema version.
///
/// Idempotent: already-applied steps are skipped via the version row.
pub fn migrate(conn: &Connection) -> Result<(), MigrateError> {
    conn.execute_batch(CREATE_SCHEMA_VERSION)
        .map_err(MigrateError::Version)?;

    let version: i64 = conn
        .query_row(GET_SCHEMA_VERSION, [], |row| row.get(0))
        .map_err(MigrateError::Version)?;
    if version < 0 {
        return Err(MigrateError::NegativeVersion(version));
    }
    if version > MIGRATIONS.len() as i64 {
        return Err(MigrateError::VersionAhead(version));
    }

    for (i, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        let step = i + 1;
        db::savepoint(conn, "migration_step", || {
            conn.execute_batch(sql)?;
            conn.execute(UPDATE_SCHEMA_VERSION, [step as i64])?;
            Ok::<_, rusqlite::Error>(())
        })
        .map_err(|source| MigrateError::Step { step, source })?;
    }

    Ok(())
}
