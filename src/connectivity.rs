//! Online/offline detection.
//!
//! State is driven two ways: request outcomes reported by the sync layer,
//! and a periodic probe of the backend. Subscribers get a
//! `watch::Receiver<bool>` that flips on every transition.

use crate::backend::Backend;
use crate::failed_ops::FailureKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
    transitions: AtomicU64,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// New monitor, assumed online until a failure says otherwise.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self {
            tx,
            transitions: AtomicU64::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Number of online/offline transitions observed so far.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Set the state. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            if online {
                tracing::info!("[NET] backend reachable again");
            } else {
                tracing::warn!("[NET] backend unreachable, switching to offline mode");
            }
        }
        changed
    }

    pub fn report_success(&self) {
        self.set_online(true);
    }

    /// Only network-class failures mean the backend is unreachable; a
    /// validation or server error proves it answered.
    pub fn report_failure(&self, kind: FailureKind) {
        if kind == FailureKind::Network {
            self.set_online(false);
        } else {
            self.set_online(true);
        }
    }

    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        // Err only when the sender is dropped, which cannot happen while
        // `self` is borrowed
        let _ = rx.wait_for(|online| *online).await;
    }

    /// Probe the backend every `interval` until `shutdown` flips to `true`.
    pub async fn run_probe_loop<B: Backend>(
        self: Arc<Self>,
        backend: Arc<B>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("[NET] probe loop started (every {}ms)", interval.as_millis());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            let reachable = backend.probe().await;
            tracing::trace!("[NET] probe reachable={}", reachable);
            self.set_online(reachable);
        }
        tracing::info!("[NET] probe loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::ScriptedBackend;

    #[test]
    fn test_starts_online_and_tracks_transitions() {
        let monitor = ConnectivityMonitor::new();
        assert!(monitor.is_online());

        monitor.report_failure(FailureKind::Validation);
        assert!(monitor.is_online());
        assert_eq!(monitor.transitions(), 0);

        monitor.report_failure(FailureKind::Network);
        assert!(!monitor.is_online());
        monitor.report_failure(FailureKind::Network);
        assert_eq!(monitor.transitions(), 1);

        monitor.report_success();
        assert!(monitor.is_online());
        assert_eq!(monitor.transitions(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_online_resolves_on_reconnect() {
        let monitor = Arc::new(ConnectivityMonitor::new());
        monitor.set_online(false);

        let m = Arc::clone(&monitor);
        let waiter = tokio::spawn(async move { m.wait_online().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        monitor.set_online(true);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop_follows_backend() {
        let monitor = Arc::new(ConnectivityMonitor::new());
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .reachable
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&monitor).run_probe_loop(
            Arc::clone(&backend),
            Duration::from_secs(15),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!monitor.is_online());

        backend
            .reachable
            .store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(monitor.is_online());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
