//! Trip stage: update rows into trip/clear state transitions.
//!
//! Consumes `honeywell5800_updates` through catchup as `honeywell5800.trip`.
//! For every configured loop of the update's sensor, the loop bit decides
//! between opening a trip and clearing the open one. The partial unique
//! index on open trips plus the guarded statements keep at most one open
//! trip per (sensor, loop) even when a row is replayed.

use rusqlite::{Connection, Row, named_params};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catchup::{BoxError, Catchup, CatchupError, Config, RunStatus};
use crate::db::Db;
use crate::honeywell5800::{Event, Kind, Sensor};

const MAX_SQL: &str = "SELECT max(id) AS max FROM honeywell5800_updates";

const NEXT_SQL: &str = "
SELECT id, sensor, event FROM honeywell5800_updates
WHERE id > @last AND id <= @max
ORDER BY id ASC
";

const FETCH_LOOPS: &str = "
SELECT s.model AS model, s.description AS description,
       l.loop AS loop, l.kind AS kind, l.label AS label,
       l.normallyOpen AS normallyOpen
FROM honeywell5800_loops AS l
INNER JOIN honeywell5800_sensors AS s ON s.id = l.sensor
WHERE l.sensor = @sensor
ORDER BY l.loop ASC
";

const INSERT_TRIP: &str = "
INSERT INTO honeywell5800_trips (sensor, loop, trippedBy)
SELECT @sensor, @loop, @trippedBy
WHERE NOT EXISTS (
    SELECT 1 FROM honeywell5800_trips
    WHERE sensor = @sensor AND loop = @loop AND clearedBy IS NULL
)
";

const CLEAR_TRIP: &str = "
UPDATE honeywell5800_trips SET clearedBy = @clearedBy
WHERE sensor = @sensor AND loop = @loop AND clearedBy IS NULL
";

#[derive(Debug, Error)]
pub enum TripError {
    #[error("reading update row: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("error fetching sensor loops: {sensor}: {source}")]
    FetchLoops {
        sensor: Sensor,
        #[source]
        source: rusqlite::Error,
    },
    #[error("bad loop in database: sensor {sensor}: {loop_no}")]
    BadLoop { sensor: Sensor, loop_no: i64 },
    #[error("add trip: {0}")]
    AddTrip(#[source] rusqlite::Error),
    #[error("clear trip: {0}")]
    ClearTrip(#[source] rusqlite::Error),
    #[error("trip dedup caused multiple rows: {0}")]
    TripFanout(usize),
    #[error("clearing trip caused multiple changes: {0}")]
    ClearFanout(usize),
}

/// One configured loop of a sensor, joined with the sensor's registration.
struct LoopConfig {
    model: String,
    description: String,
    loop_no: u8,
    kind: Kind,
    label: String,
    normally_open: bool,
}

enum Outcome {
    Applied,
    /// Nothing to do: the trip already exists, or there is nothing to clear.
    Duplicate,
}

pub struct Tripper {
    catchup: Catchup,
}

impl Tripper {
    pub fn new(db: Db) -> Self {
        Tripper {
            catchup: Catchup::new(Config {
                db,
                name: "honeywell5800.trip",
                max_sql: MAX_SQL,
                next_sql: NEXT_SQL,
            }),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunStatus, CatchupError> {
        self.catchup
            .run(cancel, |conn, row| self.process_row(conn, row))
            .await
    }

    fn process_row(&self, conn: &Connection, row: &Row<'_>) -> Result<(), BoxError> {
        let update_id: i64 = row.get("id").map_err(TripError::Sqlite)?;
        let sensor: Sensor = row.get("sensor").map_err(TripError::Sqlite)?;
        let event: Event = row.get("event").map_err(TripError::Sqlite)?;

        for lc in fetch_loops(conn, sensor)? {
            let is_open = event.loop_open(lc.loop_no);
            let is_trip = is_open != lc.normally_open;

            // per-loop state here, and again in trip/normal when the
            // stored state actually changes
            debug!(
                tripped = is_trip,
                sensor = %sensor,
                model = %lc.model,
                description = %lc.description,
                loop_no = lc.loop_no,
                kind = %lc.kind,
                label = %lc.label,
                "update"
            );

            if is_trip {
                match trip(conn, sensor, &lc, update_id)? {
                    Outcome::Applied => {
                        info!(
                            sensor = %sensor,
                            model = %lc.model,
                            description = %lc.description,
                            loop_no = lc.loop_no,
                            kind = %lc.kind,
                            label = %lc.label,
                            "trip"
                        );
                        // wakeup anyone after us in the pipeline; nobody
                        // there yet
                    }
                    Outcome::Duplicate => {}
                }
            } else {
                match normal(conn, sensor, &lc, update_id)? {
                    Outcome::Applied => {
                        info!(
                            sensor = %sensor,
                            model = %lc.model,
                            description = %lc.description,
                            loop_no = lc.loop_no,
                            kind = %lc.kind,
                            label = %lc.label,
                            "normal"
                        );
                    }
                    Outcome::Duplicate => {}
                }
            }
        }
        Ok(())
    }
}

fn fetch_loops(conn: &Connection, sensor: Sensor) -> Result<Vec<LoopConfig>, TripError> {
    let mut stmt = conn
        .prepare(FETCH_LOOPS)
        .map_err(|source| TripError::FetchLoops { sensor, source })?;
    let mut rows = stmt
        .query(named_params! {"@sensor": sensor})
        .map_err(|source| TripError::FetchLoops { sensor, source })?;
    let mut loops = Vec::new();
    loop {
        let Some(row) = rows
            .next()
            .map_err(|source| TripError::FetchLoops { sensor, source })?
        else {
            break;
        };
        let read = |row: &Row<'_>| -> Result<(Option<String>, Option<String>, i64, Kind, String, bool), rusqlite::Error> {
            Ok((
                row.get("model")?,
                row.get("description")?,
                row.get("loop")?,
                row.get("kind")?,
                row.get("label")?,
                row.get("normallyOpen")?,
            ))
        };
        let (model, description, loop_no, kind, label, normally_open) =
            read(row).map_err(|source| TripError::FetchLoops { sensor, source })?;
        let loop_no =
            u8::try_from(loop_no).map_err(|_| TripError::BadLoop { sensor, loop_no })?;
        loops.push(LoopConfig {
            model: model.unwrap_or_default(),
            description: description.unwrap_or_default(),
            loop_no,
            kind,
            label,
            normally_open,
        });
    }
    Ok(loops)
}

fn trip(
    conn: &Connection,
    sensor: Sensor,
    lc: &LoopConfig,
    update_id: i64,
) -> Result<Outcome, TripError> {
    let affected = conn
        .execute(
            INSERT_TRIP,
            named_params! {
                "@sensor": sensor,
                "@loop": i64::from(lc.loop_no),
                "@trippedBy": update_id,
            },
        )
        .map_err(TripError::AddTrip)?;
    match affected {
        0 => Ok(Outcome::Duplicate),
        1 => Ok(Outcome::Applied),
        n => Err(TripError::TripFanout(n)),
    }
}

fn normal(
    conn: &Connection,
    sensor: Sensor,
    lc: &LoopConfig,
    update_id: i64,
) -> Result<Outcome, TripError> {
    let affected = conn
        .execute(
            CLEAR_TRIP,
            named_params! {
                "@sensor": sensor,
                "@loop": i64::from(lc.loop_no),
                "@clearedBy": update_id,
            },
        )
        .map_err(TripError::ClearTrip)?;
    match affected {
        // there was no trip to clear; a replayed clear lands here too
        0 => Ok(Outcome::Duplicate),
        1 => Ok(Outcome::Applied),
        n => Err(TripError::ClearFanout(n)),
    }
}
