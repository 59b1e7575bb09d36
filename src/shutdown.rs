use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Process-wide shutdown signal. Set once by the signal handler; every loop
/// checks it between units of work and exits after the current one finishes.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves when the shutdown is triggered. Safe to call repeatedly.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a trigger in between is not
        // missed.
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
