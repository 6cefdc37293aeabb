//! Cooperative shutdown signal shared by every task group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

/// Cloneable cancellation token: a flag plus a wakeup for parked tasks.
///
/// Tasks observe cancellation at their next suspension point, either by
/// polling [`ShutdownSignal::triggered`] or by selecting over
/// [`ShutdownSignal::wait`].
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Trips the signal and wakes every parked waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has been triggered.
    pub async fn wait(&self) {
        if self.triggered() {
            return;
        }
        self.notify.notified().await;
    }

    /// Sleeps for `duration`, returning `false` when interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.notify.notified() => false,
        }
    }

    /// Spawns a watcher that trips this signal on SIGINT or SIGTERM.
    pub fn listen_for_os_signals(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            os_shutdown_request().await;
            signal.trigger();
        });
    }
}

#[cfg(unix)]
async fn os_shutdown_request() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler; SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn os_shutdown_request() {
    let _ = tokio::signal::ctrl_c().await;
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            notify: self.notify.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        signal.trigger();
        handle.await.unwrap();
        assert!(signal.triggered());
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_shutdown() {
        let signal = ShutdownSignal::new();
        let sleeper = signal.clone();
        let handle =
            tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn sleep_completes_when_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }
}
