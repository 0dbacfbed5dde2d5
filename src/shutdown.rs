// =============================================================================
// Graceful Shutdown — shared flag flipped by SIGTERM / ctrl-c
// =============================================================================
//
// Every long-running service checks this flag at the top of its loop and is
// woken out of its inter-cycle sleep when the flag flips, so an in-flight
// cycle finishes but no new one starts.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

/// Cloneable shutdown handle shared between the signal task and the loops.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake every waiter.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve when shutdown is requested.
    pub async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        self.inner.notify.notified().await;
    }

    /// Sleep for `duration`, returning early (true) if shutdown was
    /// requested in the meantime.
    pub async fn sleep_interruptible(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.wait() => true,
        }
    }
}

/// Spawn a task that flips `shutdown` on SIGTERM or ctrl-c.
pub fn install_signal_handlers(shutdown: Shutdown) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sig) => sig,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        info!("Received ctrl-c, initiating graceful shutdown");
                        shutdown.request();
                        return;
                    }
                };

            tokio::select! {
                _ = ctrl_c => info!("Received ctrl-c, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received ctrl-c, initiating graceful shutdown");
        }

        shutdown.request();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_is_observed() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_requested());
        shutdown.request();
        assert!(shutdown.is_requested());
        // wait() must return immediately once requested.
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn sleep_interrupted_by_request() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.sleep_interruptible(Duration::from_secs(30)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.request();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn sleep_completes_without_request() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep_interruptible(Duration::from_millis(5)).await);
    }
}
