//! rtl_433 subprocess supervisor.
//!
//! Spawns the external decoder, pumps its stdout lines into a [`RawStore`]
//! and its stderr lines into the log. The process-wait result is reported
//! only after both pumps have finished. Cancellation kills the subprocess
//! and counts as a clean exit.

use std::future::Future;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Honeywell 5800 sensors transmit around 345 MHz.
pub const FREQUENCY_HZ: u64 = 344_975_000;

/// Sink for raw decoder output lines.
///
/// All methods are expected to return quickly. An error from `store` aborts
/// the supervisor with that error; [`StoreError::Cancelled`] counts as a
/// clean shutdown instead.
pub trait RawStore {
    fn store(
        &self,
        cancel: &CancellationToken,
        line: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Shutdown began while waiting for a store connection.
    #[error("store cancelled")]
    Cancelled,
    #[error("cannot insert raw decoder data: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("raw data dedup affected {0} rows")]
    DedupFanout(usize),
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("cannot start rtl_433: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("reading from rtl_433: {0}")]
    Stdout(#[source] std::io::Error),
    #[error("reading rtl_433 stderr: {0}")]
    Stderr(#[source] std::io::Error),
    #[error("rtl433 store error: {0}")]
    Store(#[source] StoreError),
    #[error("waiting for rtl_433: {0}")]
    Wait(#[source] std::io::Error),
    #[error("rtl_433 exited: {0}")]
    Exited(std::process::ExitStatus),
}

/// Run the decoder until it exits, `store` fails, or `cancel` fires.
///
/// `device` selects the SDR (USB index or `:serial`); `None` lets the
/// decoder pick.
pub async fn receive<S>(
    cancel: &CancellationToken,
    device: Option<&str>,
    frequency_hz: u64,
    store: &S,
) -> Result<(), DecoderError>
where
    S: RawStore + Sync,
{
    let mut cmd = Command::new("rtl_433");
    cmd.args(["-M", "newmodel", "-F", "json", "-f"])
        .arg(frequency_hz.to_string());
    if let Some(device) = device {
        cmd.args(["-d", device]);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(DecoderError::Spawn)?;
    let stdout = child.stdout.take().expect("stdout requested piped");
    let stderr = child.stderr.take().expect("stderr requested piped");

    let stdout_pump = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.map_err(DecoderError::Stdout)? {
            match store.store(cancel, &line).await {
                Ok(()) => {}
                Err(StoreError::Cancelled) => return Ok(()),
                Err(e) => return Err(DecoderError::Store(e)),
            }
        }
        Ok(())
    };
    let stderr_pump = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await.map_err(DecoderError::Stderr)? {
            info!(target: "rtl433::stderr", "{line}");
        }
        Ok::<(), DecoderError>(())
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("stopping rtl_433");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "could not kill rtl_433");
            }
            let _ = child.wait().await;
            return Ok(());
        }
        res = async { tokio::try_join!(stdout_pump, stderr_pump) } => {
            res?;
        }
    }

    let status = child.wait().await.map_err(DecoderError::Wait)?;
    if !status.success() {
        return Err(DecoderError::Exited(status));
    }
    Ok(())
}
