//! Level-triggered "work available" signal shared by a queue and its workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// A cloneable flag that enqueuers raise and idle workers wait on.
///
/// The flag stays raised until a waiter consumes it, so a signal raised
/// between a worker finding the queue empty and going to sleep is not lost.
#[derive(Debug, Clone, Default)]
pub struct WorkSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every current waiter. Never blocks.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Wait until the signal is raised or `timeout` elapses, then clear it.
    ///
    /// Returns true when woken by the signal.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent `set`
        // cannot slip between the check and the wait.
        notified.as_mut().enable();

        if self.flag.swap(false, Ordering::SeqCst) {
            return true;
        }

        let woken = tokio::time::timeout(timeout, notified).await.is_ok();
        self.flag.swap(false, Ordering::SeqCst) || woken
    }
}
