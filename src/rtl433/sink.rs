//! Raw decoder line ingest into `rtl433_raw`.
//!
//! The insert splits `model` out of the payload in SQL, so the stored row
//! keys on natural content and repeated transmissions of the same burst
//! collapse to one row via the `(model, data)` unique constraint.

use std::future::Future;

use chrono::{DateTime, Utc};
use rusqlite::named_params;
use tokio_util::sync::CancellationToken;

use crate::db::{self, Db};
use crate::rtl433::decoder::{RawStore, StoreError};

const INSERT_RAW: &str = "
INSERT OR IGNORE INTO rtl433_raw (time, freqMHz, model, data)
VALUES (
    @time,
    @freqMHz,
    json_extract(@data, '$.model'),
    json_remove(@data, '$.model')
)
";

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type Wakeup = Box<dyn Fn() + Send + Sync>;

pub struct SqlStore {
    db: Db,
    freq_mhz: i64,
    wakeup: Wakeup,
    clock: Clock,
}

impl SqlStore {
    /// A store stamping rows with `freq_mhz`, a no-op wakeup, and the
    /// system clock.
    pub fn new(db: Db, freq_mhz: i64) -> Self {
        SqlStore {
            db,
            freq_mhz,
            wakeup: Box::new(|| {}),
            clock: Box::new(Utc::now),
        }
    }

    /// Called once for every row actually inserted (not for dedup hits).
    pub fn with_wakeup(mut self, wakeup: impl Fn() + Send + Sync + 'static) -> Self {
        self.wakeup = Box::new(wakeup);
        self
    }

    pub fn with_clock(
        mut self,
        clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.clock = Box::new(clock);
        self
    }
}

impl RawStore for SqlStore {
    fn store(
        &self,
        cancel: &CancellationToken,
        line: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            let now = (self.clock)();
            let Some(conn) = self.db.conn(cancel).await else {
                return Err(StoreError::Cancelled);
            };
            let affected = conn.execute(
                INSERT_RAW,
                named_params! {
                    "@time": db::time_to_sql(&now),
                    "@freqMHz": self.freq_mhz,
                    "@data": line,
                },
            )?;
            match affected {
                0 => {} // deduplicated; do nothing
                1 => (self.wakeup)(),
                n => return Err(StoreError::DedupFanout(n)),
            }
            Ok(())
        }
    }
}
