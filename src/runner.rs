//! Wakeup-driven cooperative loop.
//!
//! A [`Runner`] executes its work function when signaled and terminates on
//! cancellation. The wakeup channel has capacity one and starts preloaded,
//! so the first iteration always runs (processing any work left over from a
//! prior process). Extra wakeups while the slot is full are dropped; a
//! missed edge is harmless because the work function re-checks its source.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Runner {
    cancel: CancellationToken,
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
}

impl Runner {
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // process any leftovers
        let _ = tx.try_send(());
        Runner { cancel, tx, rx }
    }

    /// A handle for signaling this runner. Cheap to clone.
    pub fn waker(&self) -> Waker {
        Waker {
            tx: self.tx.clone(),
        }
    }

    /// Alternate between waiting for a wakeup and calling `work` until the
    /// cancellation token fires (a clean `Ok(())` exit) or `work` errors.
    pub async fn run<E>(mut self, mut work: impl AsyncFnMut() -> Result<(), E>) -> Result<(), E> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("exit");
                    return Ok(());
                }
                _ = self.rx.recv() => {}
            }
            work().await?;
        }
    }
}

#[derive(Clone)]
pub struct Waker {
    tx: mpsc::Sender<()>,
}

impl Waker {
    /// Non-blocking signal. A full slot drops the signal: the pending wakeup
    /// already covers whatever state this caller just produced.
    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) => debug!("wakeup"),
            Err(_) => debug!("wakeup.slow"),
        }
    }
}
