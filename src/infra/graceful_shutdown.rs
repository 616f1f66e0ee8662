//! Graceful shutdown handling
//!
//! The submission worker must never abandon an entry between "handed to the
//! remote service" and "outcome recorded", so shutdown is two-phase:
//! stop claiming new work, then drain in-flight submissions up to a timeout.
//! An entry left in `sending` by a hard kill is picked up again by the
//! operator via the admin CLI.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

/// Shutdown signal that can be cloned into tasks
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown: Arc<AtomicBool>,
    watch_rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been initiated
    pub async fn wait(&mut self) {
        if self.is_shutdown() {
            return;
        }
        // A closed channel means the coordinator is gone; treat it as shutdown.
        let _ = self.watch_rx.wait_for(|stopped| *stopped).await;
    }
}

/// Counts submissions between claim and recorded outcome
#[derive(Default)]
pub struct InFlightTracker {
    active: AtomicU64,
    total: AtomicU64,
    drained: Notify,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(self: &Arc<Self>) -> InFlightGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Wait until no submission is in flight; `false` on timeout
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.drained.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!("All in-flight submissions drained");
        } else {
            warn!(
                active = self.active_count(),
                "Timeout waiting for in-flight submissions to drain"
            );
        }
        drained
    }
}

/// Decrements the in-flight count when dropped
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}

/// Coordinates shutdown of the worker and its background tasks
pub struct ShutdownCoordinator {
    shutdown: Arc<AtomicBool>,
    watch_tx: watch::Sender<bool>,
    in_flight: Arc<InFlightTracker>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            watch_tx,
            in_flight: Arc::new(InFlightTracker::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            shutdown: self.shutdown.clone(),
            watch_rx: self.watch_tx.subscribe(),
        }
    }

    pub fn in_flight(&self) -> Arc<InFlightTracker> {
        self.in_flight.clone()
    }

    /// Stop claiming new work. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Initiating graceful shutdown...");
        self.watch_tx.send_replace(true);
    }

    /// Stop claiming new work and wait for in-flight submissions
    pub async fn graceful_shutdown(&self, drain_timeout: Duration) -> bool {
        self.shutdown();
        info!(
            active = self.in_flight.active_count(),
            "Waiting for in-flight submissions to complete..."
        );
        let drained = self.in_flight.wait_for_drain(drain_timeout).await;
        info!("Graceful shutdown complete");
        drained
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the corresponding branch never resolves.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.signal();
        assert!(!signal.is_shutdown());

        coordinator.shutdown();
        assert!(signal.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_wakes_waiting_task() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.signal();
        let waiter = tokio::spawn(async move { signal.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_tracker_counts() {
        let tracker = Arc::new(InFlightTracker::new());
        {
            let _a = tracker.start();
            let _b = tracker.start();
            assert_eq!(tracker.active_count(), 2);
        }
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.total_count(), 2);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_drain() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.in_flight().start();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(coordinator.graceful_shutdown(Duration::from_secs(5)).await);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_times_out() {
        let coordinator = ShutdownCoordinator::new();
        let _guard = coordinator.in_flight().start();
        assert!(!coordinator.graceful_shutdown(Duration::from_millis(20)).await);
    }
}
