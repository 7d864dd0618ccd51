/// End-to-end pipeline scenarios over an in-memory store.
///
/// Drives the real stages (raw sink → receive → trip) the way the daemon
/// wires them, but with a fixed clock and counting wakeups instead of
/// runners, so every step is observable.
use chrono::{DateTime, TimeZone, Utc};
use rfsentry::db::Db;
use rfsentry::honeywell5800::receive::Receiver;
use rfsentry::honeywell5800::trip::Tripper;
use rfsentry::rtl433::{RawStore, SqlStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 2, 3, 4, 5, 6).unwrap()
}

async fn count(db: &Db, table: &str) -> i64 {
    let cancel = CancellationToken::new();
    let conn = db.conn(&cancel).await.unwrap();
    conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

async fn exec(db: &Db, sql: &str) {
    let cancel = CancellationToken::new();
    let conn = db.conn(&cancel).await.unwrap();
    conn.execute_batch(sql).unwrap();
}

struct Pipeline {
    db: Db,
    store: SqlStore,
    receiver: Receiver,
    tripper: Tripper,
    sink_wakeups: Arc<AtomicU64>,
    recv_wakeups: Arc<AtomicU64>,
}

fn pipeline(clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Pipeline {
    let db = Db::scratch();
    let sink_wakeups = Arc::new(AtomicU64::new(0));
    let recv_wakeups = Arc::new(AtomicU64::new(0));

    let sink_counter = Arc::clone(&sink_wakeups);
    let store = SqlStore::new(db.clone(), 345)
        .with_wakeup(move || {
            sink_counter.fetch_add(1, Ordering::Relaxed);
        })
        .with_clock(clock);

    let recv_counter = Arc::clone(&recv_wakeups);
    let receiver = Receiver::new(db.clone(), move || {
        recv_counter.fetch_add(1, Ordering::Relaxed);
    });
    let tripper = Tripper::new(db.clone());

    Pipeline {
        db,
        store,
        receiver,
        tripper,
        sink_wakeups,
        recv_wakeups,
    }
}

// ---------------------------------------------------------------------------
// Raw → update
// ---------------------------------------------------------------------------

#[tokio::test]
async fn junk_model_flows_nowhere() {
    let cancel = CancellationToken::new();
    let p = pipeline(t0);

    p.store.store(&cancel, r#"{"model":"junk"}"#).await.unwrap();
    assert_eq!(p.sink_wakeups.load(Ordering::Relaxed), 1, "raw row stored");

    p.receiver.run(&cancel).await.unwrap();
    assert_eq!(count(&p.db, "honeywell5800_updates").await, 0);
    assert_eq!(p.recv_wakeups.load(Ordering::Relaxed), 0);

    p.tripper.run(&cancel).await.unwrap();
    assert_eq!(count(&p.db, "honeywell5800_trips").await, 0);
}

#[tokio::test]
async fn honeywell_line_flows_to_one_update() {
    let cancel = CancellationToken::new();
    let p = pipeline(t0);

    p.store
        .store(
            &cancel,
            r#"{"model":"Honeywell-Security","channel":3,"id":123456,"event":128}"#,
        )
        .await
        .unwrap();
    p.receiver.run(&cancel).await.unwrap();

    assert_eq!(count(&p.db, "honeywell5800_updates").await, 1);
    assert_eq!(p.recv_wakeups.load(Ordering::Relaxed), 1);
}

// ---------------------------------------------------------------------------
// Duplicate radio burst
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_burst_collapses_to_one_of_everything() {
    let cancel = CancellationToken::new();
    let p = pipeline(t0);
    exec(
        &p.db,
        "INSERT INTO honeywell5800_loops (sensor, loop, kind, label, normallyOpen)
         VALUES (123456, 1, 'door or window open', 'front door', 0);",
    )
    .await;

    let line = r#"{"model":"Honeywell-Security","channel":3,"id":123456,"event":128}"#;
    for _ in 0..3 {
        p.store.store(&cancel, line).await.unwrap();
    }
    assert_eq!(count(&p.db, "rtl433_raw").await, 1);
    assert_eq!(p.sink_wakeups.load(Ordering::Relaxed), 1);

    p.receiver.run(&cancel).await.unwrap();
    assert_eq!(count(&p.db, "honeywell5800_updates").await, 1);
    assert_eq!(p.recv_wakeups.load(Ordering::Relaxed), 1);

    p.tripper.run(&cancel).await.unwrap();
    assert_eq!(count(&p.db, "honeywell5800_trips").await, 1);
}

// ---------------------------------------------------------------------------
// Trip then clear, across the whole chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trip_opens_then_clears() {
    let cancel = CancellationToken::new();
    let p = pipeline(t0);
    // loop configuration can precede the sensor's first transmission
    exec(
        &p.db,
        "INSERT INTO honeywell5800_loops (sensor, loop, kind, label, normallyOpen)
         VALUES (123456, 1, 'door or window open', 'front door', 0);",
    )
    .await;

    p.store
        .store(
            &cancel,
            r#"{"model":"Honeywell-Security","channel":3,"id":123456,"event":128}"#,
        )
        .await
        .unwrap();
    p.receiver.run(&cancel).await.unwrap();
    p.tripper.run(&cancel).await.unwrap();

    let conn = p.db.conn(&cancel).await.unwrap();
    let (tripped_by, cleared_by) = conn
        .query_row(
            "SELECT trippedBy, clearedBy FROM honeywell5800_trips",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
        )
        .unwrap();
    assert_eq!(tripped_by, 1);
    assert_eq!(cleared_by, None);
    drop(conn);

    // loop closes again (event 0 differs, so no dedup in the way)
    p.store
        .store(
            &cancel,
            r#"{"model":"Honeywell-Security","channel":3,"id":123456,"event":0}"#,
        )
        .await
        .unwrap();
    p.receiver.run(&cancel).await.unwrap();
    p.tripper.run(&cancel).await.unwrap();

    assert_eq!(count(&p.db, "honeywell5800_trips").await, 1);
    let conn = p.db.conn(&cancel).await.unwrap();
    let cleared_by: Option<i64> = conn
        .query_row("SELECT clearedBy FROM honeywell5800_trips", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(cleared_by, Some(2));
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rerunning_caught_up_stages_changes_nothing() {
    let cancel = CancellationToken::new();
    let p = pipeline(t0);
    exec(
        &p.db,
        "INSERT INTO honeywell5800_loops (sensor, loop, kind, label, normallyOpen)
         VALUES (123456, 1, 'door or window open', 'front door', 0);",
    )
    .await;

    p.store
        .store(
            &cancel,
            r#"{"model":"Honeywell-Security","channel":3,"id":123456,"event":128}"#,
        )
        .await
        .unwrap();
    for _ in 0..3 {
        p.receiver.run(&cancel).await.unwrap();
        p.tripper.run(&cancel).await.unwrap();
    }

    assert_eq!(count(&p.db, "honeywell5800_updates").await, 1);
    assert_eq!(count(&p.db, "honeywell5800_trips").await, 1);
    assert_eq!(p.recv_wakeups.load(Ordering::Relaxed), 1);

    let cancel = CancellationToken::new();
    let conn = p.db.conn(&cancel).await.unwrap();
    let recv_cursor: i64 = conn
        .query_row(
            "SELECT last FROM catchup WHERE name = 'honeywell5800.receive'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let trip_cursor: i64 = conn
        .query_row(
            "SELECT last FROM catchup WHERE name = 'honeywell5800.trip'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(recv_cursor, 1);
    assert_eq!(trip_cursor, 1);
}

// ---------------------------------------------------------------------------
// Fresh consumers resume from the persisted cursor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_stage_instances_resume_where_the_old_ones_stopped() {
    let cancel = CancellationToken::new();
    let p = pipeline(t0);

    p.store
        .store(
            &cancel,
            r#"{"model":"Honeywell-Security","channel":3,"id":123456,"event":128}"#,
        )
        .await
        .unwrap();
    p.receiver.run(&cancel).await.unwrap();
    assert_eq!(count(&p.db, "honeywell5800_updates").await, 1);

    // a "restarted" receiver sharing the same store sees nothing new
    let wakeups = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&wakeups);
    let fresh = Receiver::new(p.db.clone(), move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    fresh.run(&cancel).await.unwrap();
    assert_eq!(count(&p.db, "honeywell5800_updates").await, 1);
    assert_eq!(wakeups.load(Ordering::Relaxed), 0);
}
