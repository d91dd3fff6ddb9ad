//! Counter-based join primitive for fan-out writes

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// A wait group: `add` and `done` adjust a counter, `wait` blocks until it
/// reaches zero.
///
/// Callers must not call `done` without a matching prior `add`; the counter
/// is allowed to go transiently negative only through that misuse.
#[derive(Debug, Default)]
pub struct WaitGroup {
    total: AtomicI64,
    zero: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add entities to wait on.
    pub fn add(&self, n: i64) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    /// Mark entities as completed, waking waiters when the counter hits zero.
    pub fn done(&self, n: i64) {
        if self.total.fetch_sub(n, Ordering::SeqCst) - n <= 0 {
            self.zero.notify_waiters();
        }
    }

    /// The number of entities not yet marked completed.
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Wait until the counter reaches zero. Returns immediately if it is
    /// already there.
    pub async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a concurrent `done`
            // cannot slip between the check and the await.
            notified.as_mut().enable();

            if self.total.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }
}
