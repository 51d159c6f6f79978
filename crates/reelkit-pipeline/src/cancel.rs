//! Cooperative cancellation.
//!
//! A watch-channel pair: the caller keeps the [`CancelHandle`], the pipeline
//! clones the [`CancelSignal`] into every suspension point.

use tokio::sync::watch;

/// Sender side; cancelling is idempotent.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver side, observed at every suspension point.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a connected handle/signal pair.
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires, for callers without cancellation.
    pub fn never() -> CancelSignal {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes
        std::mem::forget(tx);
        CancelSignal { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Handle dropped without cancelling
        std::future::pending::<()>().await;
    }

    /// Raw watch receiver, for the ffmpeg runner.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}
