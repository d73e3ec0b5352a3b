//! Optimistic local updates with typed resolution.
//!
//! [`OptimisticManager::apply`] runs a local change right away and keeps
//! its undo closure under the operation id. The returned [`Pending`] must
//! be resolved exactly once: `confirm` keeps the change, `rollback` undoes
//! it, and dropping it unresolved rolls back with a warning.

use crate::error::{Result, SyncError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

type Rollback = Box<dyn FnOnce() + Send + Sync + 'static>;

struct PendingUpdate {
    started_at: std::time::Instant,
    rollback: Rollback,
}

#[derive(Default)]
pub struct OptimisticManager {
    pending: Arc<DashMap<String, PendingUpdate>>,
}

/// What became of an optimistic change once the backend answered.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// Backend accepted the write; the local change stands.
    Confirmed(T),
    /// Backend could not be reached; the local change stands and the
    /// write is left to the retry queue.
    Queued(E),
    /// Backend rejected the write; the local change was undone.
    RolledBack(E),
}

impl<T, E> Outcome<T, E> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Outcome::Confirmed(_))
    }
}

/// Token for an unresolved optimistic change.
#[must_use = "an optimistic update must be confirmed or rolled back"]
pub struct Pending {
    op_id: String,
    pending: Arc<DashMap<String, PendingUpdate>>,
    resolved: bool,
}

impl Pending {
    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    /// Keep the local change.
    pub fn confirm(mut self) {
        self.resolved = true;
        if let Some((_, update)) = self.pending.remove(&self.op_id) {
            tracing::debug!(
                "[OPTIMISTIC] confirmed {} after {}ms",
                self.op_id,
                update.started_at.elapsed().as_millis()
            );
        }
    }

    /// Undo the local change.
    pub fn rollback(mut self) {
        self.resolved = true;
        self.run_rollback();
    }

    fn run_rollback(&self) {
        if let Some((_, update)) = self.pending.remove(&self.op_id) {
            (update.rollback)();
            tracing::debug!("[OPTIMISTIC] rolled back {}", self.op_id);
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(
                "[OPTIMISTIC] {} dropped without confirm or rollback; rolling back",
                self.op_id
            );
            self.run_rollback();
        }
    }
}

impl OptimisticManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `transform` now and remember `rollback` for `op_id`.
    ///
    /// Fails with [`SyncError::AlreadyPending`] if `op_id` is already
    /// pending; `transform` is not run in that case. If `transform` fails,
    /// nothing is registered.
    pub fn apply<F, R>(&self, op_id: &str, transform: F, rollback: R) -> Result<Pending>
    where
        F: FnOnce() -> Result<()>,
        R: FnOnce() + Send + Sync + 'static,
    {
        match self.pending.entry(op_id.to_string()) {
            Entry::Occupied(_) => Err(SyncError::AlreadyPending(op_id.to_string())),
            Entry::Vacant(slot) => {
                transform()?;
                slot.insert(PendingUpdate {
                    started_at: std::time::Instant::now(),
                    rollback: Box::new(rollback),
                });
                Ok(Pending {
                    op_id: op_id.to_string(),
                    pending: Arc::clone(&self.pending),
                    resolved: false,
                })
            }
        }
    }

    /// Await the backend and resolve `pending` from its result.
    ///
    /// On error, `keep_on_error` decides between keeping the change
    /// (`Queued`) and undoing it (`RolledBack`).
    pub async fn settle<T, E, Fut, K>(pending: Pending, fut: Fut, keep_on_error: K) -> Outcome<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        K: FnOnce(&E) -> bool,
    {
        match fut.await {
            Ok(value) => {
                pending.confirm();
                Outcome::Confirmed(value)
            }
            Err(e) if keep_on_error(&e) => {
                pending.confirm();
                Outcome::Queued(e)
            }
            Err(e) => {
                pending.rollback();
                Outcome::RolledBack(e)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, op_id: &str) -> bool {
        self.pending.contains_key(op_id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
