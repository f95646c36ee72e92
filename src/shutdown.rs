//! Process-wide shutdown flag that retry loops can wait on

use tokio::sync::watch;

/// Cloneable shutdown signal backed by a watch channel.
///
/// Every clone observes the same flag; once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleeps for `duration` unless shutdown comes first.
    ///
    /// Returns `false` when the sleep was cut short by shutdown.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
