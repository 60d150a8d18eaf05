use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use sidecar_core::Persister;

enum Signal {
    Schedule,
    Flush(oneshot::Sender<()>),
}

/// Coalescing timer in front of the host save callback.
///
/// Each `schedule` resets the timer; the callback runs once after `delay` of
/// quiet. Failures are logged and never reach the caller. Dropping every
/// handle stops the worker after a final save of any pending work.
#[derive(Clone)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Debouncer {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(persister: Arc<dyn Persister>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(persister, delay, rx));
        Self { tx }
    }

    pub fn schedule(&self) {
        if self.tx.send(Signal::Schedule).is_err() {
            warn!("persistence worker stopped, save request dropped");
        }
    }

    /// Run any pending save now and wait for it.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Signal::Flush(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run(persister: Arc<dyn Persister>, delay: Duration, mut rx: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = rx.recv().await {
        match signal {
            Signal::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
            Signal::Schedule => {}
        }

        // Something is pending: wait for quiet, resetting on every new request.
        let mut ack = None;
        let mut closed = false;
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(Signal::Schedule) => continue,
                    Some(Signal::Flush(tx)) => {
                        ack = Some(tx);
                        break;
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
                () = tokio::time::sleep(delay) => break,
            }
        }

        persist(persister.as_ref()).await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        if closed {
            break;
        }
    }
    debug!("persistence worker stopped");
}

async fn persist(persister: &dyn Persister) {
    match persister.persist().await {
        Ok(()) => debug!("host state persisted"),
        Err(e) => warn!(error = %e, "persistence failed"),
    }
}
