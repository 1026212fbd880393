use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative shutdown flag shared by the daemon's tasks
///
/// Blocking loops poll `is_shutdown_requested`; async tasks await `wait`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    should_shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.should_shutdown.load(Ordering::Relaxed)
    }

    pub fn initiate_shutdown(&self) {
        self.should_shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Resolve once shutdown has been initiated
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }
}
