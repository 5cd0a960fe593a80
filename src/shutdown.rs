//! Graceful shutdown coordination.
//!
//! One [`ShutdownCoordinator`] is shared by every long-running task in the
//! process; components subscribe and exit within bounded time of the
//! signal. Calling [`ShutdownCoordinator::shutdown`] twice is safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Broadcast-backed shutdown signal.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_watch: watch::Receiver<bool>,
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown broadcast for use in `select!`.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Fire the shutdown signal. Idempotent.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Resolve once shutdown has been initiated.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates OS signals into a shutdown.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wait for SIGTERM/SIGINT and fire the coordinator.
    #[cfg(unix)]
    pub async fn run(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "installing SIGTERM handler failed");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "installing SIGINT handler failed");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        self.coordinator.shutdown();
    }

    #[cfg(not(unix))]
    pub async fn run(self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt");
        }
        self.coordinator.shutdown();
    }
}
