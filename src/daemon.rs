//! Pipeline orchestration.
//!
//! Wires store, stages, runners, and the decoder supervisor into one
//! cancellable task group. Wakeups flow downstream (sink → receive → trip)
//! to cut latency; correctness never depends on them, because every runner
//! starts with one preloaded wakeup and re-checks its source.

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::catchup::BoxError;
use crate::db::{Db, DbError};
use crate::honeywell5800::receive::Receiver;
use crate::honeywell5800::trip::Tripper;
use crate::rtl433::decoder;
use crate::rtl433::sink::SqlStore;
use crate::runner::Runner;

/// Raw rows record the dial frequency in MHz.
const FREQ_MHZ: i64 = 345;

pub struct Config {
    pub db_path: String,
    /// SDR selection (USB index or `:serial`); `None` lets the decoder pick.
    pub sdr_device: Option<String>,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("{0}")]
    Task(BoxError),
}

/// Run the pipeline until a signal arrives or a task fails.
///
/// The first task to end, for any reason, cancels the rest; the first error
/// (if any) is returned after all tasks have drained.
pub async fn run(conf: &Config) -> Result<(), DaemonError> {
    let cancel = CancellationToken::new();
    let db = Db::open(&conf.db_path)?;

    let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();

    let trip_runner = Runner::new(cancel.clone());
    let wake_trip = trip_runner.waker();
    {
        let tripper = Tripper::new(db.clone());
        let cancel = cancel.clone();
        tasks.spawn(async move {
            trip_runner
                .run(async move || {
                    tripper
                        .run(&cancel)
                        .await
                        .map(|_| ())
                        .map_err(BoxError::from)
                })
                .await
        });
    }

    let recv_runner = Runner::new(cancel.clone());
    let wake_recv = recv_runner.waker();
    {
        let receiver = Receiver::new(db.clone(), move || wake_trip.wake());
        let cancel = cancel.clone();
        tasks.spawn(async move {
            recv_runner
                .run(async move || {
                    receiver
                        .run(&cancel)
                        .await
                        .map(|_| ())
                        .map_err(BoxError::from)
                })
                .await
        });
    }

    {
        let store = SqlStore::new(db.clone(), FREQ_MHZ).with_wakeup(move || wake_recv.wake());
        let cancel = cancel.clone();
        let device = conf.sdr_device.clone();
        tasks.spawn(async move {
            decoder::receive(&cancel, device.as_deref(), decoder::FREQUENCY_HZ, &store)
                .await
                .map_err(BoxError::from)
        });
    }

    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            shutdown_signal(&cancel).await;
            Ok(())
        });
    }

    let mut first_err: Option<BoxError> = None;
    while let Some(joined) = tasks.join_next().await {
        cancel.cancel();
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    error!(error = %e, "additional task failure");
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(Box::new(e));
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(DaemonError::Task(e)),
        None => Ok(()),
    }
}

#[cfg(unix)]
async fn shutdown_signal(cancel: &CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return cancel.cancelled().await;
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::signal::ctrl_c() => info!("interrupt"),
        _ = term.recv() => info!("terminated"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::signal::ctrl_c() => info!("interrupt"),
    }
}
