//! Durable queue of writes the backend did not accept.
//!
//! Each failure is classified. Network failures are retried automatically
//! on a fixed schedule (5s, 15s, 45s by default) and abandoned after the
//! last delay; every other class waits for a manual retry or dismissal.
//! Records expire a fixed time after they were first recorded.
//!
//! State lives in memory and is journaled on every change, so the queue
//! survives restarts. The journal is compacted once enough superseded
//! entries pile up.

use crate::backend::{BackendError, WebhookOp};
use crate::clock::SharedClock;
use crate::error::{Result, SyncError};
use crate::journal::Journal;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

const COMPACT_AFTER_ENTRIES: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum FailureKind {
    Network,
    Validation,
    Server,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Server => write!(f, "server"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum FailedOpStatus {
    /// Waiting for its next retry (automatic or manual).
    Pending,
    /// A retry is in flight.
    Retrying,
    /// Automatic retries exhausted.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FailedOperation {
    pub id: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub op: WebhookOp,
    pub payload: serde_json::Value,
    pub kind: FailureKind,
    pub error: String,
    /// Retries performed so far, not counting the original attempt.
    pub retries: u32,
    pub created_at_ms: u64,
    pub last_attempt_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at_ms: Option<u64>,
    pub status: FailedOpStatus,
    /// Lease key the original write held, so a retry can take the same
    /// lock and not race a fresh write of the same record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl FailedOperation {
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.status == FailedOpStatus::Pending
            && self.next_retry_at_ms.map(|t| t <= now_ms).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before each automatic retry; its length is the retry limit.
    pub delays_ms: Vec<u64>,
    /// Records older than this are dropped.
    pub expiry_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays_ms: vec![5_000, 15_000, 45_000],
            expiry_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        self.delays_ms.len() as u32
    }

    /// Delay before retry number `retries + 1`, if another automatic retry
    /// is allowed.
    pub fn delay_for(&self, retries: u32) -> Option<u64> {
        self.delays_ms.get(retries as usize).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FailedOpCounts {
    pub total: usize,
    pub network: usize,
    pub validation: usize,
    pub server: usize,
    pub unknown: usize,
    pub abandoned: usize,
}

pub struct FailedOperationsManager {
    records: DashMap<String, FailedOperation>,
    journal: Journal,
    policy: RetryPolicy,
    clock: SharedClock,
    appended_since_compact: AtomicU64,
    wake: Notify,
}

impl FailedOperationsManager {
    /// Open the queue, replaying its journal from `dir`.
    pub fn open(dir: &Path, policy: RetryPolicy, clock: SharedClock) -> Result<Self> {
        let journal = Journal::open(dir)?;
        let records = DashMap::new();
        let entries = journal.read_since(0)?;
        let replayed = entries.len() as u64;

        for entry in entries {
            match entry.kind.as_str() {
                "record" => match serde_json::from_value::<FailedOperation>(entry.payload) {
                    Ok(op) => {
                        records.insert(op.id.clone(), op);
                    }
                    Err(e) => tracing::warn!("[RETRY] bad journal record seq {}: {}", entry.seq, e),
                },
                "remove" => {
                    if let Some(id) = entry.payload.get("id").and_then(|v| v.as_str()) {
                        records.remove(id);
                    }
                }
                other => {
                    tracing::warn!("[RETRY] unknown journal entry {} at seq {}", other, entry.seq)
                }
            }
        }

        // A retry that was in flight when the process stopped is pending again
        for mut rec in records.iter_mut() {
            if rec.status == FailedOpStatus::Retrying {
                rec.status = FailedOpStatus::Pending;
            }
        }

        let manager = Self {
            records,
            journal,
            policy,
            clock,
            appended_since_compact: AtomicU64::new(replayed),
            wake: Notify::new(),
        };
        let purged = manager.purge_expired()?;
        tracing::info!(
            "[RETRY] restored {} failed operations ({} expired)",
            manager.len(),
            purged
        );
        manager.maybe_compact()?;
        Ok(manager)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn persist(&self, op: &FailedOperation) -> Result<()> {
        self.journal.append("record", serde_json::to_value(op)?)?;
        self.appended_since_compact.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn persist_removal(&self, id: &str) -> Result<()> {
        self.journal
            .append("remove", serde_json::json!({ "id": id }))?;
        self.appended_since_compact.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn maybe_compact(&self) -> Result<()> {
        let appended = self.appended_since_compact.load(Ordering::Relaxed);
        if appended < COMPACT_AFTER_ENTRIES || appended < 2 * self.records.len() as u64 {
            return Ok(());
        }
        let live: Vec<(String, serde_json::Value)> = self
            .records
            .iter()
            .map(|r| Ok(("record".to_string(), serde_json::to_value(r.value())?)))
            .collect::<Result<_>>()?;
        self.journal.compact(&live)?;
        self.appended_since_compact
            .store(live.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Record a failed write. Network failures get their first automatic
    /// retry scheduled; other classes wait for a manual retry.
    pub fn record(
        &self,
        op: WebhookOp,
        payload: serde_json::Value,
        error: &BackendError,
        dedup_key: Option<String>,
    ) -> Result<FailedOperation> {
        let now = self.clock.now_ms();
        let kind = error.classify();
        let next_retry_at_ms = match kind {
            FailureKind::Network => self.policy.delay_for(0).map(|d| now + d),
            _ => None,
        };
        let rec = FailedOperation {
            id: format!("fop_{}", uuid::Uuid::new_v4().simple()),
            op,
            payload,
            kind,
            error: error.to_string(),
            retries: 0,
            created_at_ms: now,
            last_attempt_ms: now,
            next_retry_at_ms,
            status: FailedOpStatus::Pending,
            dedup_key,
        };
        self.persist(&rec)?;
        self.records.insert(rec.id.clone(), rec.clone());
        tracing::warn!(
            "[RETRY] recorded {} failure for {} ({}): {}",
            kind,
            op,
            rec.id,
            rec.error
        );
        self.wake.notify_one();
        Ok(rec)
    }

    pub fn get(&self, id: &str) -> Option<FailedOperation> {
        self.records.get(id).map(|r| r.clone())
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<FailedOperation> {
        let mut all: Vec<FailedOperation> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    /// Records whose retry time has come, earliest first.
    pub fn due(&self, now_ms: u64) -> Vec<FailedOperation> {
        let mut due: Vec<FailedOperation> = self
            .records
            .iter()
            .filter(|r| r.is_due(now_ms))
            .map(|r| r.clone())
            .collect();
        due.sort_by_key(|r| r.next_retry_at_ms);
        due
    }

    /// Earliest scheduled retry among pending records.
    pub fn next_due_at(&self) -> Option<u64> {
        self.records
            .iter()
            .filter(|r| r.status == FailedOpStatus::Pending)
            .filter_map(|r| r.next_retry_at_ms)
            .min()
    }

    /// Mark a record as being retried right now.
    pub fn mark_in_flight(&self, id: &str) -> Result<FailedOperation> {
        let now = self.clock.now_ms();
        let updated = {
            let mut rec = self
                .records
                .get_mut(id)
                .ok_or_else(|| SyncError::FailedOperationNotFound(id.to_string()))?;
            rec.status = FailedOpStatus::Retrying;
            rec.last_attempt_ms = now;
            rec.clone()
        };
        self.persist(&updated)?;
        Ok(updated)
    }

    /// Register another failed attempt and schedule the next one.
    pub fn mark_attempt_failed(&self, id: &str, error: &BackendError) -> Result<FailedOperation> {
        let now = self.clock.now_ms();
        let updated = {
            let mut rec = self
                .records
                .get_mut(id)
                .ok_or_else(|| SyncError::FailedOperationNotFound(id.to_string()))?;
            rec.retries += 1;
            rec.kind = error.classify();
            rec.error = error.to_string();
            rec.last_attempt_ms = now;
            match rec.kind {
                FailureKind::Network => match self.policy.delay_for(rec.retries) {
                    Some(delay) => {
                        rec.status = FailedOpStatus::Pending;
                        rec.next_retry_at_ms = Some(now + delay);
                    }
                    None => {
                        rec.status = FailedOpStatus::Abandoned;
                        rec.next_retry_at_ms = None;
                    }
                },
                _ => {
                    rec.status = FailedOpStatus::Pending;
                    rec.next_retry_at_ms = None;
                }
            }
            rec.clone()
        };
        self.persist(&updated)?;
        if updated.status == FailedOpStatus::Abandoned {
            tracing::error!(
                "[RETRY] giving up on {} ({}) after {} retries: {}",
                updated.op,
                updated.id,
                updated.retries,
                updated.error
            );
        }
        Ok(updated)
    }

    /// Schedule an immediate retry regardless of failure class or status.
    /// The worker is not woken; the caller replays the record itself.
    pub fn reset_for_manual_retry(&self, id: &str) -> Result<FailedOperation> {
        let now = self.clock.now_ms();
        let updated = {
            let mut rec = self
                .records
                .get_mut(id)
                .ok_or_else(|| SyncError::FailedOperationNotFound(id.to_string()))?;
            if rec.status == FailedOpStatus::Abandoned {
                // One more automatic cycle starting from the last delay
                rec.retries = self.policy.max_retries().saturating_sub(1);
            }
            rec.status = FailedOpStatus::Pending;
            rec.next_retry_at_ms = Some(now);
            rec.clone()
        };
        self.persist(&updated)?;
        Ok(updated)
    }

    /// Drop a record after success or dismissal.
    pub fn remove(&self, id: &str) -> Result<Option<FailedOperation>> {
        let removed = self.records.remove(id).map(|(_, r)| r);
        if removed.is_some() {
            self.persist_removal(id)?;
            self.maybe_compact()?;
        }
        Ok(removed)
    }

    /// Remove records past their expiry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let expiry = self.policy.expiry_ms;
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|r| now.saturating_sub(r.created_at_ms) >= expiry)
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            self.records.remove(id);
            self.persist_removal(id)?;
            tracing::info!("[RETRY] expired failed operation {}", id);
        }
        if !expired.is_empty() {
            self.maybe_compact()?;
        }
        Ok(expired.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn counts(&self) -> FailedOpCounts {
        let mut counts = FailedOpCounts::default();
        for rec in self.records.iter() {
            counts.total += 1;
            match rec.kind {
                FailureKind::Network => counts.network += 1,
                FailureKind::Validation => counts.validation += 1,
                FailureKind::Server => counts.server += 1,
                FailureKind::Unknown => counts.unknown += 1,
            }
            if rec.status == FailedOpStatus::Abandoned {
                counts.abandoned += 1;
            }
        }
        counts
    }

    /// Wake the retry worker.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn woken(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &Path, clock: &Arc<ManualClock>) -> FailedOperationsManager {
        FailedOperationsManager::open(dir, RetryPolicy::default(), clock.clone()).unwrap()
    }

    fn network() -> BackendError {
        BackendError::Network("connection refused".into())
    }

    #[test]
    fn test_network_failure_follows_fixed_backoff_then_abandons() {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000_000);
        let fops = open(tmp.path(), &clock);

        let rec = fops
            .record(WebhookOp::CreateLead, json!({"id": "L1"}), &network(), None)
            .unwrap();
        assert_eq!(rec.kind, FailureKind::Network);
        assert_eq!(rec.next_retry_at_ms, Some(1_005_000));
        assert!(fops.due(1_004_999).is_empty());
        assert_eq!(fops.due(1_005_000).len(), 1);

        clock.set_ms(1_005_000);
        let r1 = fops.mark_attempt_failed(&rec.id, &network()).unwrap();
        assert_eq!(r1.retries, 1);
        assert_eq!(r1.next_retry_at_ms, Some(1_020_000));

        clock.set_ms(1_020_000);
        let r2 = fops.mark_attempt_failed(&rec.id, &network()).unwrap();
        assert_eq!(r2.next_retry_at_ms, Some(1_065_000));

        clock.set_ms(1_065_000);
        let r3 = fops.mark_attempt_failed(&rec.id, &network()).unwrap();
        assert_eq!(r3.retries, 3);
        assert_eq!(r3.status, FailedOpStatus::Abandoned);
        assert!(r3.next_retry_at_ms.is_none());
        assert!(fops.due(u64::MAX).is_empty());
        assert_eq!(fops.counts().abandoned, 1);
    }

    #[test]
    fn test_non_network_failures_wait_for_manual_retry() {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(500);
        let fops = open(tmp.path(), &clock);

        let err = BackendError::Http {
            status: 422,
            body: "phone is required".into(),
        };
        let rec = fops
            .record(WebhookOp::CreateLead, json!({}), &err, None)
            .unwrap();
        assert_eq!(rec.kind, FailureKind::Validation);
        assert!(rec.next_retry_at_ms.is_none());
        assert!(fops.due(u64::MAX).is_empty());

        fops.reset_for_manual_retry(&rec.id).unwrap();
        assert_eq!(fops.due(500).len(), 1);
    }

    #[test]
    fn test_manual_retry_revives_abandoned_for_one_cycle() {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(0);
        let fops = open(tmp.path(), &clock);
        let rec = fops
            .record(WebhookOp::DeleteLead, json!({"id": "L1"}), &network(), None)
            .unwrap();
        for _ in 0..3 {
            fops.mark_attempt_failed(&rec.id, &network()).unwrap();
        }
        assert_eq!(fops.get(&rec.id).unwrap().status, FailedOpStatus::Abandoned);

        fops.reset_for_manual_retry(&rec.id).unwrap();
        let again = fops.mark_attempt_failed(&rec.id, &network()).unwrap();
        assert_eq!(again.status, FailedOpStatus::Abandoned);
    }

    #[test]
    fn test_records_expire_after_a_day() {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(0);
        let fops = open(tmp.path(), &clock);
        fops.record(WebhookOp::ScheduleTask, json!({}), &network(), None)
            .unwrap();

        clock.advance_ms(24 * 60 * 60 * 1000 - 1);
        assert_eq!(fops.purge_expired().unwrap(), 0);
        clock.advance_ms(1);
        assert_eq!(fops.purge_expired().unwrap(), 1);
        assert!(fops.is_empty());
    }

    #[test]
    fn test_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(10_000);
        let (kept, dropped) = {
            let fops = open(tmp.path(), &clock);
            let a = fops
                .record(WebhookOp::UpdateLead, json!({"id": "L1"}), &network(), None)
                .unwrap();
            let b = fops
                .record(WebhookOp::DeleteLead, json!({"id": "L2"}), &network(), None)
                .unwrap();
            fops.mark_in_flight(&a.id).unwrap();
            fops.remove(&b.id).unwrap();
            (a.id, b.id)
        };

        let fops = open(tmp.path(), &clock);
        assert_eq!(fops.len(), 1);
        assert!(fops.get(&dropped).is_none());
        // In-flight at shutdown means pending after restart
        assert_eq!(fops.get(&kept).unwrap().status, FailedOpStatus::Pending);
    }

    #[test]
    fn test_journal_compacts_after_churn() {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(0);
        let fops = open(tmp.path(), &clock);
        for i in 0..300 {
            let rec = fops
                .record(WebhookOp::CreateLead, json!({"i": i}), &network(), None)
                .unwrap();
            fops.remove(&rec.id).unwrap();
        }
        let keep = fops
            .record(WebhookOp::CreateLead, json!({"i": "last"}), &network(), None)
            .unwrap();
        drop(fops);

        let fops = open(tmp.path(), &clock);
        assert_eq!(fops.len(), 1);
        assert!(fops.get(&keep.id).is_some());
        let journal = Journal::open(tmp.path()).unwrap();
        // 601 entries were appended; the compacted journal holds far fewer
        assert!(journal.read_since(0).unwrap().len() < 200);
    }

    #[test]
    fn test_unknown_id_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(0);
        let fops = open(tmp.path(), &clock);
        assert!(matches!(
            fops.mark_in_flight("nope"),
            Err(SyncError::FailedOperationNotFound(_))
        ));
        assert!(fops.remove("nope").unwrap().is_none());
    }
}
