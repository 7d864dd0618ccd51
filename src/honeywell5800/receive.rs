//! Parse stage: `rtl433_raw` rows into per-sensor update rows.
//!
//! Consumes the raw log through catchup as `honeywell5800.receive`. Each
//! Honeywell row is decoded strictly, the sensor is registered if unseen,
//! and the update is inserted unless an identical one landed within the
//! 5-second dedup window (one-way radio transmissions repeat rapidly).

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, Row, named_params};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catchup::{BoxError, Catchup, CatchupError, Config, RunStatus};
use crate::db::{self, Db};
use crate::honeywell5800::{Channel, Event, Sensor};

const MAX_SQL: &str = "SELECT max(id) AS max FROM rtl433_raw";

// Rows from other decoders are skipped here, not parsed; the cursor moves
// past them when a later Honeywell row is processed.
const NEXT_SQL: &str = "
SELECT id, time, data FROM rtl433_raw
WHERE id > @last AND id <= @max AND model = 'Honeywell-Security'
ORDER BY id ASC
";

const INSERT_SENSOR: &str = "
INSERT OR IGNORE INTO honeywell5800_sensors (id, created)
VALUES (@sensor, @created)
";

const INSERT_UPDATE: &str = "
INSERT INTO honeywell5800_updates (time, channel, sensor, event)
SELECT @time, @channel, @sensor, @event
WHERE NOT EXISTS (
    SELECT 1 FROM honeywell5800_updates
    WHERE sensor = @sensor AND channel = @channel AND event = @event
      AND time > @dedupTime
)
";

const DEDUP_WINDOW_SECONDS: i64 = 5;

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("cannot parse rtl_433 output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("parsing raw row time: {0}")]
    Time(#[from] db::ColumnError),
    #[error("reading raw row: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("adding sensor: {0}")]
    AddSensor(#[source] rusqlite::Error),
    #[error("add sensor update: {0}")]
    AddUpdate(#[source] rusqlite::Error),
    #[error("sensor update dedup caused multiple rows: {0}")]
    DedupFanout(usize),
}

/// One decoder output line, decoded strictly: unknown fields or trailing
/// content mean the decoder emitted something we cannot interpret.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DecodedMessage {
    id: Sensor,
    channel: Channel,
    event: Event,
}

enum UpdateOutcome {
    Inserted,
    Duplicate,
}

pub struct Receiver {
    catchup: Catchup,
    wakeup: Box<dyn Fn() + Send + Sync>,
}

impl Receiver {
    /// `wakeup` is called once per update row actually inserted, to nudge
    /// the trip stage.
    pub fn new(db: Db, wakeup: impl Fn() + Send + Sync + 'static) -> Self {
        Receiver {
            catchup: Catchup::new(Config {
                db,
                name: "honeywell5800.receive",
                max_sql: MAX_SQL,
                next_sql: NEXT_SQL,
            }),
            wakeup: Box::new(wakeup),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunStatus, CatchupError> {
        self.catchup
            .run(cancel, |conn, row| self.process_row(conn, row))
            .await
    }

    fn process_row(&self, conn: &Connection, row: &Row<'_>) -> Result<(), BoxError> {
        let ts = db::get_time(row, "time").map_err(ReceiveError::Time)?;
        let data: String = row.get("data").map_err(ReceiveError::Sqlite)?;
        let msg: DecodedMessage = serde_json::from_str(&data).map_err(ReceiveError::Parse)?;
        debug!(
            sensor = %msg.id,
            channel = u8::from(msg.channel),
            event = %msg.event,
            event_parsed = %msg.event.verbose(),
            "received"
        );
        match add_update(conn, &ts, &msg)? {
            UpdateOutcome::Duplicate => {}
            UpdateOutcome::Inserted => (self.wakeup)(),
        }
        Ok(())
    }
}

/// Register the sensor if needed and insert the update row.
///
/// No inner savepoint: any partial progress here is idempotent, and the
/// catchup row savepoint covers the whole unit anyway.
fn add_update(
    conn: &Connection,
    ts: &DateTime<Utc>,
    msg: &DecodedMessage,
) -> Result<UpdateOutcome, ReceiveError> {
    conn.execute(
        INSERT_SENSOR,
        named_params! {"@sensor": msg.id, "@created": db::time_to_sql(ts)},
    )
    .map_err(ReceiveError::AddSensor)?;

    let dedup_time = *ts - Duration::seconds(DEDUP_WINDOW_SECONDS);
    let affected = conn
        .execute(
            INSERT_UPDATE,
            named_params! {
                "@time": db::time_to_sql(ts),
                "@dedupTime": db::time_to_sql(&dedup_time),
                "@channel": msg.channel,
                "@sensor": msg.id,
                "@event": msg.event,
            },
        )
        .map_err(ReceiveError::AddUpdate)?;
    match affected {
        0 => Ok(UpdateOutcome::Duplicate),
        1 => Ok(UpdateOutcome::Inserted),
        n => Err(ReceiveError::DedupFanout(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::rtl433::{RawStore, SqlStore};
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 2, 3, 4, 5, 6).unwrap()
            + chrono::Duration::nanoseconds(7)
    }

    async fn update_count(db: &Db) -> i64 {
        let cancel = CancellationToken::new();
        let conn = db.conn(&cancel).await.unwrap();
        conn.query_row("SELECT count(*) FROM honeywell5800_updates", [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    fn counting_receiver(db: &Db) -> (Receiver, Arc<AtomicU64>) {
        let wakeups = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&wakeups);
        let recv = Receiver::new(db.clone(), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        (recv, wakeups)
    }

    #[tokio::test]
    async fn junk_rows_produce_nothing() {
        let cancel = CancellationToken::new();
        let db = Db::scratch();
        let (recv, wakeups) = counting_receiver(&db);
        let store = SqlStore::new(db.clone(), 123).with_clock(now);

        store
            .store(&cancel, r#"{"model": "junk"}"#)
            .await
            .unwrap();
        let status = recv.run(&cancel).await.unwrap();
        assert_eq!(status, RunStatus::CaughtUp);
        assert_eq!(update_count(&db).await, 0);
        assert_eq!(wakeups.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn honeywell_row_becomes_one_update() {
        let cancel = CancellationToken::new();
        let db = Db::scratch();
        let (recv, wakeups) = counting_receiver(&db);
        let store = SqlStore::new(db.clone(), 123).with_clock(now);

        store
            .store(
                &cancel,
                r#"{"model": "Honeywell-Security", "channel": 3, "id": 123456, "event": 128}"#,
            )
            .await
            .unwrap();
        recv.run(&cancel).await.unwrap();

        assert_eq!(update_count(&db).await, 1);
        assert_eq!(wakeups.load(Ordering::Relaxed), 1);

        let conn = db.conn(&cancel).await.unwrap();
        let (columns, time, channel, sensor, event) = conn
            .query_row("SELECT * FROM honeywell5800_updates", [], |row| {
                Ok((
                    row.as_ref().column_count(),
                    row.get::<_, String>("time")?,
                    row.get::<_, i64>("channel")?,
                    row.get::<_, i64>("sensor")?,
                    row.get::<_, i64>("event")?,
                ))
            })
            .unwrap();
        assert_eq!(columns, 5);
        assert_eq!(time, db::time_to_sql(&now()));
        assert_eq!(channel, 3);
        assert_eq!(sensor, 123456);
        assert_eq!(event, 0x80);

        // the sensor registered lazily, stamped with the row time
        let created: String = conn
            .query_row(
                "SELECT created FROM honeywell5800_sensors WHERE id = 123456",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(created, db::time_to_sql(&now()));
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let cancel = CancellationToken::new();
        let db = Db::scratch();
        let (recv, wakeups) = counting_receiver(&db);
        let store = SqlStore::new(db.clone(), 123).with_clock(now);

        store
            .store(
                &cancel,
                r#"{"model": "Honeywell-Security", "channel": 3, "id": 123456, "event": 128}"#,
            )
            .await
            .unwrap();
        recv.run(&cancel).await.unwrap();
        recv.run(&cancel).await.unwrap();

        assert_eq!(update_count(&db).await, 1);
        assert_eq!(wakeups.load(Ordering::Relaxed), 1);
    }

    async fn insert_raw(db: &Db, ts: &DateTime<Utc>, data: &str) {
        let cancel = CancellationToken::new();
        let conn = db.conn(&cancel).await.unwrap();
        conn.execute(
            "INSERT INTO rtl433_raw (time, freqMHz, model, data)
             VALUES (?1, 345, 'Honeywell-Security', ?2)",
            rusqlite::params![db::time_to_sql(ts), data],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn dedup_window_is_closed_on_the_lower_bound() {
        let cancel = CancellationToken::new();
        let db = Db::scratch();
        let (recv, _wakeups) = counting_receiver(&db);

        // identical (sensor, channel, event); distinct raw rows thanks to
        // differing key order
        let t0 = now();
        insert_raw(&db, &t0, r#"{"id":123456,"channel":3,"event":128}"#).await;
        insert_raw(
            &db,
            &(t0 + chrono::Duration::milliseconds(4_999)),
            r#"{"channel":3,"id":123456,"event":128}"#,
        )
        .await;
        insert_raw(
            &db,
            &(t0 + chrono::Duration::seconds(5)),
            r#"{"event":128,"id":123456,"channel":3}"#,
        )
        .await;

        recv.run(&cancel).await.unwrap();
        assert_eq!(
            update_count(&db).await,
            2,
            "within 5s dropped, at exactly 5s admitted"
        );
    }

    #[tokio::test]
    async fn unparseable_honeywell_row_fails_loud() {
        let cancel = CancellationToken::new();
        let db = Db::scratch();
        let (recv, wakeups) = counting_receiver(&db);

        insert_raw(&db, &now(), r#"{"bogus": 1}"#).await;
        let err = recv.run(&cancel).await.unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("honeywell5800.receive"),
            "missing consumer name: {msg}"
        );
        assert_eq!(update_count(&db).await, 0);
        assert_eq!(wakeups.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn out_of_range_sensor_fails_loud() {
        let cancel = CancellationToken::new();
        let db = Db::scratch();
        let (recv, _wakeups) = counting_receiver(&db);

        insert_raw(&db, &now(), r#"{"id":1048577,"channel":3,"event":128}"#).await;
        let err = recv.run(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("20 bits"), "wrong error: {err}");
    }
}
