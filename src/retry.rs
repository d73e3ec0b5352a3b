//! Background worker that replays failed writes.
//!
//! The worker sleeps until the earliest scheduled retry, a wake-up from
//! the failed-operations queue (new record, manual retry), a reconnect, or
//! shutdown. Each pass purges expired records and replays the due ones
//! under the same lease a live write would take. On reconnect every
//! waiting network failure is replayed at once instead of waiting out its
//! delay.

use crate::backend::Backend;
use crate::cache::CacheManager;
use crate::clock::SharedClock;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::failed_ops::{FailedOpStatus, FailedOperation, FailedOperationsManager, FailureKind};
use crate::lease::{dedup_key, LeaseManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Upper bound on a single sleep, so expired records are purged even when
/// nothing is scheduled.
const IDLE_WAIT_MS: u64 = 60_000;
/// Back-off when a due record was skipped because its lease is busy.
const BUSY_WAIT_MS: u64 = 1_000;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryPass {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub purged: usize,
}

pub struct RetryWorker<B: Backend> {
    backend: Arc<B>,
    failed_ops: Arc<FailedOperationsManager>,
    connectivity: Arc<ConnectivityMonitor>,
    cache: Arc<CacheManager>,
    leases: Arc<LeaseManager>,
    clock: SharedClock,
    owner: String,
}

impl<B: Backend> Clone for RetryWorker<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            failed_ops: Arc::clone(&self.failed_ops),
            connectivity: Arc::clone(&self.connectivity),
            cache: Arc::clone(&self.cache),
            leases: Arc::clone(&self.leases),
            clock: Arc::clone(&self.clock),
            owner: self.owner.clone(),
        }
    }
}

impl<B: Backend> RetryWorker<B> {
    pub fn new(
        backend: Arc<B>,
        failed_ops: Arc<FailedOperationsManager>,
        connectivity: Arc<ConnectivityMonitor>,
        cache: Arc<CacheManager>,
        leases: Arc<LeaseManager>,
        clock: SharedClock,
        owner: String,
    ) -> Self {
        Self {
            backend,
            failed_ops,
            connectivity,
            cache,
            leases,
            clock,
            owner,
        }
    }

    /// Replay one record now, holding its lease for the duration.
    ///
    /// Network failures come back as [`SyncError::Offline`] since the
    /// record stays queued; other failures as [`SyncError::Backend`].
    /// If the record was attempted since `rec` was read, nothing is sent
    /// and [`SyncError::DuplicateOperation`] is returned.
    pub async fn attempt(&self, rec: &FailedOperation) -> Result<serde_json::Value> {
        let key = rec
            .dedup_key
            .clone()
            .unwrap_or_else(|| dedup_key(rec.op, &rec.payload));
        let mut guard = self.leases.acquire_guard(&key, &self.owner, None)?;
        let current = self
            .failed_ops
            .get(&rec.id)
            .ok_or_else(|| SyncError::FailedOperationNotFound(rec.id.clone()))?;
        if current.retries != rec.retries || current.last_attempt_ms != rec.last_attempt_ms {
            tracing::debug!("[RETRY] {} ({}) moved on, skipping", rec.op, rec.id);
            return Err(SyncError::DuplicateOperation(key));
        }
        self.failed_ops.mark_in_flight(&rec.id)?;

        tracing::info!(
            "[RETRY] replaying {} ({}), retry #{}",
            rec.op,
            rec.id,
            rec.retries + 1
        );
        match guard
            .hold_during(self.backend.call(rec.op, &rec.payload))
            .await
        {
            Ok(value) => {
                self.failed_ops.remove(&rec.id)?;
                self.connectivity.report_success();
                self.cache.mark_changed();
                if let Some(collection) = rec.op.collection() {
                    self.cache
                        .invalidate_operation(collection.fetch_op().as_str());
                }
                tracing::info!("[RETRY] {} ({}) succeeded", rec.op, rec.id);
                Ok(value)
            }
            Err(e) => {
                let kind = e.classify();
                self.connectivity.report_failure(kind);
                let updated = self.failed_ops.mark_attempt_failed(&rec.id, &e)?;
                tracing::warn!(
                    "[RETRY] {} ({}) failed again ({}): {}",
                    rec.op,
                    rec.id,
                    kind,
                    e
                );
                if kind == FailureKind::Network {
                    Err(SyncError::Offline(format!(
                        "{} still unreachable, {} retries so far",
                        updated.op, updated.retries
                    )))
                } else {
                    Err(SyncError::Backend {
                        operation: rec.op.to_string(),
                        kind,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// One pass: purge expired records, then replay what is due. With
    /// `reconnected`, waiting network failures are replayed early.
    pub async fn run_pass(&self, reconnected: bool) -> RetryPass {
        let mut pass = RetryPass::default();
        match self.failed_ops.purge_expired() {
            Ok(n) => pass.purged = n,
            Err(e) => tracing::error!("[RETRY] purge failed: {}", e),
        }

        let now = self.clock.now_ms();
        let mut due = self.failed_ops.due(now);
        if reconnected {
            for rec in self.failed_ops.list() {
                let waiting = rec.kind == FailureKind::Network
                    && rec.next_retry_at_ms.is_some()
                    && !rec.is_due(now);
                if waiting && rec.status == FailedOpStatus::Pending {
                    due.push(rec);
                }
            }
        }

        for rec in due {
            pass.attempted += 1;
            match self.attempt(&rec).await {
                Ok(_) => pass.succeeded += 1,
                Err(SyncError::LeaseHeld { .. }) => {
                    pass.attempted -= 1;
                    pass.skipped += 1;
                }
                Err(SyncError::FailedOperationNotFound(_))
                | Err(SyncError::DuplicateOperation(_)) => {
                    // Dismissed or replayed elsewhere since `due` was read
                    pass.attempted -= 1;
                }
                Err(_) => pass.failed += 1,
            }
        }

        if pass.attempted > 0 || pass.purged > 0 {
            tracing::debug!("[RETRY] pass {:?}", pass);
        }
        pass
    }

    fn next_wait(&self, pass: &RetryPass) -> Duration {
        let now = self.clock.now_ms();
        let until_due = self
            .failed_ops
            .next_due_at()
            .map(|t| t.saturating_sub(now))
            .unwrap_or(IDLE_WAIT_MS)
            .min(IDLE_WAIT_MS);
        let wait = if pass.skipped > 0 {
            until_due.max(BUSY_WAIT_MS)
        } else {
            until_due
        };
        Duration::from_millis(wait)
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "[RETRY] worker started with {} queued operations",
            self.failed_ops.len()
        );
        let mut online = self.connectivity.subscribe();
        let mut reconnected = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let pass = self.run_pass(reconnected).await;
            reconnected = false;
            let wait = self.next_wait(&pass);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.failed_ops.woken() => {}
                res = online.changed() => {
                    if res.is_ok() && *online.borrow_and_update() {
                        reconnected = true;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("[RETRY] worker stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
