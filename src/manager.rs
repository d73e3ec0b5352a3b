//! The sync context a frontend talks to.
//!
//! [`SyncManager`] owns every piece of the sync layer (store, cache,
//! connectivity monitor, failed-operations queue, optimistic manager and
//! lease table) and the [`Backend`]. It is built once with
//! [`SyncManager::open`], started with [`SyncManager::start`] (retry
//! worker, probe loop, lease sweeper) and torn down with
//! [`SyncManager::shutdown`].
//!
//! Reads prefer a fresh cache entry, then the backend, then the local
//! snapshot, then a stale cache entry. Writes take a lease on their dedup
//! key, apply the change to the local store, call the backend and settle:
//!
//! - accepted: the change stands, the collection's cache entries go
//! - unreachable: the change stands and the write is queued for retry
//! - rejected: the change is undone and the failure recorded for a
//!   manual retry

use crate::backend::{Backend, BackendError, WebhookOp};
use crate::cache::{cache_key, CacheManager, CacheStats};
use crate::clock::{self, SharedClock};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::failed_ops::{FailedOpCounts, FailedOperation, FailedOperationsManager, FailureKind};
use crate::lease::{dedup_key, Lease, LeaseManager};
use crate::optimistic::{OptimisticManager, Outcome};
use crate::reconcile::{find_changes, resolve_duplicate_ids};
use crate::retry::RetryWorker;
use crate::store::LocalStore;
use crate::types::{
    Agent, AgentPatch, Collection, FollowUpTask, GeneratedMessage, Lead, LeadPatch, Listing,
    ListingSource, MessageRequest, NewAgent, NewLead, NewTask, Notification, Record, TaskStatus,
    Written,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Snapshot of the sync layer for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SyncStatus {
    pub online: bool,
    pub connectivity_transitions: u64,
    pub pending_optimistic: usize,
    pub failed: FailedOpCounts,
    pub cache: CacheStats,
    pub active_leases: usize,
    pub store_keys: Vec<String>,
}

enum LocalChange<T> {
    Upsert(T),
    Remove(String),
}

pub struct SyncManager<B: Backend> {
    config: SyncConfig,
    clock: SharedClock,
    backend: Arc<B>,
    store: Arc<LocalStore>,
    cache: Arc<CacheManager>,
    connectivity: Arc<ConnectivityMonitor>,
    failed_ops: Arc<FailedOperationsManager>,
    optimistic: OptimisticManager,
    leases: Arc<LeaseManager>,
    retry: RetryWorker<B>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Pull the record list out of a webhook read response. Accepts a bare
/// array or an object carrying the list under the collection name,
/// `data` or `items`.
fn extract_items<T: Record>(value: serde_json::Value) -> std::result::Result<Vec<T>, BackendError> {
    let list = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => map
            .remove(T::COLLECTION.as_str())
            .or_else(|| map.remove("data"))
            .or_else(|| map.remove("items"))
            .ok_or_else(|| {
                BackendError::Decode(format!("no {} list in response", T::COLLECTION))
            })?,
        other => {
            return Err(BackendError::Decode(format!(
                "expected a {} list, got {}",
                T::COLLECTION,
                other
            )))
        }
    };
    serde_json::from_value(list).map_err(|e| BackendError::Decode(e.to_string()))
}

/// The authoritative record from a write response, if the backend echoed
/// one back with the expected id.
fn record_from_response<T: Record>(value: &serde_json::Value, id: &str) -> Option<T> {
    [Some(value), value.get("data")]
        .into_iter()
        .flatten()
        .filter_map(|v| serde_json::from_value::<T>(v.clone()).ok())
        .find(|r| r.id() == id)
}

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

impl<B: Backend> SyncManager<B> {
    pub fn open(config: SyncConfig, backend: Arc<B>) -> Result<Arc<Self>> {
        Self::open_with_clock(config, backend, clock::system())
    }

    pub fn open_with_clock(
        config: SyncConfig,
        backend: Arc<B>,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(LocalStore::open(
            &config.store_dir(),
            &config.store_prefix,
            clock.clone(),
        )?);
        let cache = Arc::new(CacheManager::new(config.cache.clone(), clock.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new());
        let failed_ops = Arc::new(FailedOperationsManager::open(
            &config.failed_ops_dir(),
            config.retry.clone(),
            clock.clone(),
        )?);
        let leases = Arc::new(LeaseManager::new(config.lease_ttl_ms, clock.clone()));
        let retry = RetryWorker::new(
            Arc::clone(&backend),
            Arc::clone(&failed_ops),
            Arc::clone(&connectivity),
            Arc::clone(&cache),
            Arc::clone(&leases),
            clock.clone(),
            config.owner.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            "[SYNC] opened at {} as {} ({} queued failures)",
            config.data_dir.display(),
            config.owner,
            failed_ops.len()
        );

        Ok(Arc::new(Self {
            config,
            clock,
            backend,
            store,
            cache,
            connectivity,
            failed_ops,
            optimistic: OptimisticManager::new(),
            leases,
            retry,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    /// Spawn the retry worker, the probe loop and the lease sweeper. Calling
    /// it again while they run is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return Ok(());
        }

        tasks.push(self.retry.clone().spawn(self.shutdown_tx.subscribe()));
        tasks.push(tokio::spawn(Arc::clone(&self.connectivity).run_probe_loop(
            Arc::clone(&self.backend),
            Duration::from_millis(self.config.probe_interval_ms),
            self.shutdown_tx.subscribe(),
        )));

        let leases = Arc::clone(&self.leases);
        let interval = Duration::from_millis(self.config.sweep_interval_ms);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        leases.sweep_expired();
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        tracing::info!("[SYNC] background tasks started");
        Ok(())
    }

    /// Stop background tasks and wait for them. Later calls fail with
    /// [`SyncError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("[SYNC] background task failed: {}", e);
            }
        }
        tracing::info!(
            "[SYNC] shut down ({} failures still queued)",
            self.failed_ops.len()
        );
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn failed_ops(&self) -> &FailedOperationsManager {
        &self.failed_ops
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn optimistic(&self) -> &OptimisticManager {
        &self.optimistic
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub async fn list_leads(&self) -> Result<Listing<Lead>> {
        self.list_with(|fetched: &mut Vec<Lead>, previous: &[Lead]| {
            let renames = resolve_duplicate_ids(fetched);
            for (old, new) in &renames {
                tracing::debug!("[SYNC] duplicate lead id {} stored as {}", old, new);
            }
            let changes = find_changes(previous, fetched);
            if !changes.is_empty() {
                tracing::info!("[SYNC] leads changed since last fetch: {}", changes.summary());
            }
        })
        .await
    }

    pub async fn list_agents(&self) -> Result<Listing<Agent>> {
        self.list_with(|_: &mut Vec<Agent>, _: &[Agent]| {}).await
    }

    pub async fn list_tasks(&self) -> Result<Listing<FollowUpTask>> {
        self.list_with(|_: &mut Vec<FollowUpTask>, _: &[FollowUpTask]| {})
            .await
    }

    pub async fn list_notifications(&self) -> Result<Listing<Notification>> {
        self.list_with(|_: &mut Vec<Notification>, _: &[Notification]| {})
            .await
    }

    async fn list_with<T, F>(&self, post_fetch: F) -> Result<Listing<T>>
    where
        T: Record,
        F: FnOnce(&mut Vec<T>, &[T]),
    {
        self.ensure_open()?;
        let op = T::COLLECTION.fetch_op();
        let key = cache_key(op.as_str(), &serde_json::json!({}));

        if let Some(data) = self.cache.get(&key) {
            if let Ok(items) = serde_json::from_value::<Vec<T>>(data) {
                return Ok(Listing {
                    items,
                    stale: false,
                    source: ListingSource::Cache,
                });
            }
            self.cache.invalidate(&key);
        }

        let failure = if self.connectivity.is_online() {
            let fetched = self
                .backend
                .call(op, &serde_json::json!({}))
                .await
                .and_then(extract_items::<T>);
            match fetched {
                Ok(mut items) => {
                    self.connectivity.report_success();
                    let previous = self.store.load_collection::<T>().unwrap_or_default();
                    post_fetch(&mut items, &previous);
                    self.store.save_collection(&items)?;
                    self.cache.set(key, serde_json::to_value(&items)?);
                    return Ok(Listing {
                        items,
                        stale: false,
                        source: ListingSource::Backend,
                    });
                }
                Err(e) => {
                    self.connectivity.report_failure(e.classify());
                    tracing::warn!("[SYNC] {} failed, falling back: {}", op, e);
                    e
                }
            }
        } else {
            BackendError::Network("offline".to_string())
        };

        if self
            .store
            .is_snapshot_fresh(T::COLLECTION, self.config.max_snapshot_age_ms)
        {
            return Ok(Listing {
                items: self.store.load_collection()?,
                stale: true,
                source: ListingSource::Store,
            });
        }
        if let Some(age) = self.store.collection_age(T::COLLECTION) {
            tracing::debug!("[SYNC] {} snapshot too old to serve ({}ms)", T::COLLECTION, age);
        }
        if let Some((data, age)) = self.cache.get_stale(&key) {
            tracing::debug!("[SYNC] serving {} from stale cache ({}ms old)", op, age);
            let items = serde_json::from_value(data)
                .map_err(|e| SyncError::Corrupt(format!("stale cache entry {}: {}", key, e)))?;
            return Ok(Listing {
                items,
                stale: true,
                source: ListingSource::Cache,
            });
        }
        Err(SyncError::Backend {
            operation: op.to_string(),
            kind: failure.classify(),
            message: format!("{} and nothing stored locally", failure),
        })
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    /// Lease, apply locally, call the backend, settle. Returns the record
    /// as it stands afterwards (`None` for removals), marked with the
    /// failed-operation id when the write was queued for retry.
    async fn write<T: Record>(
        &self,
        op: WebhookOp,
        lock_key: String,
        payload: serde_json::Value,
        change: LocalChange<T>,
    ) -> Result<Written<Option<T>>> {
        self.ensure_open()?;
        let mut guard = self
            .leases
            .acquire_guard(&lock_key, &self.config.owner, None)
            .map_err(|e| match e {
                SyncError::LeaseHeld { key, .. } => SyncError::DuplicateOperation(key),
                other => other,
            })?;

        let id = match &change {
            LocalChange::Upsert(record) => record.id().to_string(),
            LocalChange::Remove(id) => id.clone(),
        };
        let prior: Option<T> = self.store.get_record(&id)?;
        let store = Arc::clone(&self.store);
        let restore_id = id.clone();
        let restore = prior.clone();
        let rollback = move || {
            let res = match restore {
                Some(prev) => store.upsert_record(&prev).map(|_| ()),
                None => store.remove_record::<T>(&restore_id).map(|_| ()),
            };
            if let Err(e) = res {
                tracing::error!("[SYNC] rollback of {} failed: {}", restore_id, e);
            }
        };
        let local = match &change {
            LocalChange::Upsert(record) => Some(record.clone()),
            LocalChange::Remove(_) => None,
        };
        let pending = self.optimistic.apply(
            &lock_key,
            || match &change {
                LocalChange::Upsert(record) => self.store.upsert_record(record).map(|_| ()),
                LocalChange::Remove(id) => self.store.remove_record::<T>(id).map(|_| ()),
            },
            rollback,
        )?;
        self.invalidate_collection(T::COLLECTION);

        if !self.connectivity.is_online() {
            pending.confirm();
            let err = BackendError::Network("offline".to_string());
            let rec = self
                .failed_ops
                .record(op, payload, &err, Some(lock_key))?;
            self.cache.mark_changed();
            tracing::info!("[SYNC] {} {} queued offline as {}", op, id, rec.id);
            return Ok(Written {
                record: local,
                queued_as: Some(rec.id),
            });
        }

        let result = guard.hold_during(self.backend.call(op, &payload)).await;
        if !guard.is_current() {
            tracing::warn!("[SYNC] lease on {} lapsed during {}", lock_key, op);
            if result.is_err() {
                // Another writer owns the key now; queueing would race it
                pending.rollback();
                self.cache.mark_changed();
                self.invalidate_collection(T::COLLECTION);
                return Err(SyncError::StaleLease {
                    key: lock_key,
                    token: guard.token(),
                });
            }
        }
        let outcome = OptimisticManager::settle(
            pending,
            std::future::ready(result),
            |e: &BackendError| e.classify() == FailureKind::Network,
        )
        .await;
        self.cache.mark_changed();
        self.invalidate_collection(T::COLLECTION);

        match outcome {
            Outcome::Confirmed(response) => {
                self.connectivity.report_success();
                let authoritative = local
                    .as_ref()
                    .and_then(|_| record_from_response::<T>(&response, &id));
                if let Some(record) = &authoritative {
                    self.store.upsert_record(record)?;
                }
                tracing::debug!("[SYNC] {} {} accepted", op, id);
                Ok(Written::confirmed(authoritative.or(local)))
            }
            Outcome::Queued(e) => {
                self.connectivity.report_failure(FailureKind::Network);
                let rec = self.failed_ops.record(op, payload, &e, Some(lock_key))?;
                Ok(Written {
                    record: local,
                    queued_as: Some(rec.id),
                })
            }
            Outcome::RolledBack(e) => {
                let kind = e.classify();
                self.connectivity.report_failure(kind);
                self.failed_ops.record(op, payload, &e, Some(lock_key))?;
                Err(SyncError::Backend {
                    operation: op.to_string(),
                    kind,
                    message: e.to_string(),
                })
            }
        }
    }

    fn invalidate_collection(&self, collection: Collection) {
        self.cache
            .invalidate_operation(collection.fetch_op().as_str());
    }

    fn existing<T: Record>(&self, id: &str) -> Result<T> {
        self.store
            .get_record::<T>(id)?
            .ok_or_else(|| SyncError::NotFound {
                collection: T::COLLECTION.to_string(),
                id: id.to_string(),
            })
    }

    fn expect_record<T>(written: Written<Option<T>>) -> Result<Written<T>> {
        let Written { record, queued_as } = written;
        let record = record
            .ok_or_else(|| SyncError::InvalidRecord("write returned no record".to_string()))?;
        Ok(Written { record, queued_as })
    }

    pub async fn create_lead(&self, input: NewLead) -> Result<Written<Lead>> {
        // Locked on the input so a repeated submit of the same form is caught
        let lock_key = dedup_key(WebhookOp::CreateLead, &serde_json::to_value(&input)?);
        let lead = input.into_lead(new_id("lead"), self.now_utc())?;
        let payload = serde_json::to_value(&lead)?;
        let written = self
            .write(WebhookOp::CreateLead, lock_key, payload, LocalChange::Upsert(lead))
            .await?;
        Self::expect_record(written)
    }

    pub async fn update_lead(&self, id: &str, patch: LeadPatch) -> Result<Written<Lead>> {
        if patch.is_empty() {
            return Err(SyncError::InvalidRecord("empty lead update".to_string()));
        }
        let mut lead: Lead = self.existing(id)?;
        let now = self.now_utc();
        patch.apply_to(&mut lead, now);

        let mut payload = serde_json::to_value(&patch)?;
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("id".to_string(), serde_json::json!(id));
            map.insert("updatedAt".to_string(), serde_json::to_value(now)?);
        }
        let lock_key = dedup_key(WebhookOp::UpdateLead, &payload);
        let written = self
            .write(WebhookOp::UpdateLead, lock_key, payload, LocalChange::Upsert(lead))
            .await?;
        Self::expect_record(written)
    }

    /// Returns the failed-operation id when the delete was queued.
    pub async fn delete_lead(&self, id: &str) -> Result<Option<String>> {
        let payload = serde_json::json!({ "id": id });
        let lock_key = dedup_key(WebhookOp::DeleteLead, &payload);
        let written = self
            .write::<Lead>(
                WebhookOp::DeleteLead,
                lock_key,
                payload,
                LocalChange::Remove(id.to_string()),
            )
            .await?;
        Ok(written.queued_as)
    }

    pub async fn create_agent(&self, input: NewAgent) -> Result<Written<Agent>> {
        let lock_key = dedup_key(WebhookOp::CreateAgent, &serde_json::to_value(&input)?);
        let agent = input.into_agent(new_id("agent"))?;
        let payload = serde_json::to_value(&agent)?;
        let written = self
            .write(WebhookOp::CreateAgent, lock_key, payload, LocalChange::Upsert(agent))
            .await?;
        Self::expect_record(written)
    }

    pub async fn update_agent(&self, id: &str, patch: AgentPatch) -> Result<Written<Agent>> {
        if patch.is_empty() {
            return Err(SyncError::InvalidRecord("empty agent update".to_string()));
        }
        let mut agent: Agent = self.existing(id)?;
        patch.apply_to(&mut agent);

        let mut payload = serde_json::to_value(&patch)?;
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("id".to_string(), serde_json::json!(id));
        }
        let lock_key = dedup_key(WebhookOp::UpdateAgent, &payload);
        let written = self
            .write(WebhookOp::UpdateAgent, lock_key, payload, LocalChange::Upsert(agent))
            .await?;
        Self::expect_record(written)
    }

    /// Returns the failed-operation id when the delete was queued.
    pub async fn delete_agent(&self, id: &str) -> Result<Option<String>> {
        let payload = serde_json::json!({ "id": id });
        let lock_key = dedup_key(WebhookOp::DeleteAgent, &payload);
        let written = self
            .write::<Agent>(
                WebhookOp::DeleteAgent,
                lock_key,
                payload,
                LocalChange::Remove(id.to_string()),
            )
            .await?;
        Ok(written.queued_as)
    }

    pub async fn schedule_task(&self, input: NewTask) -> Result<Written<FollowUpTask>> {
        if input.lead_id.trim().is_empty() {
            return Err(SyncError::InvalidRecord(
                "task must reference a lead".to_string(),
            ));
        }
        let lock_key = dedup_key(WebhookOp::ScheduleTask, &serde_json::to_value(&input)?);
        let task = FollowUpTask {
            id: new_id("task"),
            lead_id: input.lead_id,
            channel: input.channel,
            scheduled_at: input.scheduled_at,
            message: input.message,
            status: TaskStatus::Scheduled,
            created_at: Some(self.now_utc()),
        };
        let payload = serde_json::to_value(&task)?;
        let written = self
            .write(WebhookOp::ScheduleTask, lock_key, payload, LocalChange::Upsert(task))
            .await?;
        Self::expect_record(written)
    }

    pub async fn complete_task(&self, id: &str) -> Result<Written<FollowUpTask>> {
        let mut task: FollowUpTask = self.existing(id)?;
        task.status = TaskStatus::Completed;
        let payload = serde_json::json!({ "id": id, "status": TaskStatus::Completed });
        let lock_key = dedup_key(WebhookOp::CompleteTask, &payload);
        let written = self
            .write(WebhookOp::CompleteTask, lock_key, payload, LocalChange::Upsert(task))
            .await?;
        Self::expect_record(written)
    }

    pub async fn mark_notification_read(&self, id: &str) -> Result<Written<Notification>> {
        let mut notification: Notification = self.existing(id)?;
        notification.read = true;
        let payload = serde_json::json!({ "id": id, "read": true });
        let lock_key = dedup_key(WebhookOp::MarkNotificationRead, &payload);
        let written = self
            .write(
                WebhookOp::MarkNotificationRead,
                lock_key,
                payload,
                LocalChange::Upsert(notification),
            )
            .await?;
        Self::expect_record(written)
    }

    /// Ask the backend for an outreach message. Results are cached per
    /// request; the backend must be reachable for anything uncached.
    pub async fn generate_message(&self, req: MessageRequest) -> Result<GeneratedMessage> {
        self.ensure_open()?;
        let op = WebhookOp::GenerateMessage;
        let payload = serde_json::to_value(&req)?;
        let key = cache_key(op.as_str(), &payload);

        if let Some(hit) = self.cache.get(&key) {
            if let Ok(message) = serde_json::from_value::<GeneratedMessage>(hit) {
                return Ok(message);
            }
        }
        if !self.connectivity.is_online() {
            return Err(SyncError::Backend {
                operation: op.to_string(),
                kind: FailureKind::Network,
                message: "message generation needs the backend".to_string(),
            });
        }

        let response = match self.backend.call(op, &payload).await {
            Ok(v) => {
                self.connectivity.report_success();
                v
            }
            Err(e) => {
                let kind = e.classify();
                self.connectivity.report_failure(kind);
                return Err(SyncError::Backend {
                    operation: op.to_string(),
                    kind,
                    message: e.to_string(),
                });
            }
        };

        let text = response
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| response.as_str())
            .ok_or_else(|| SyncError::Backend {
                operation: op.to_string(),
                kind: FailureKind::Unknown,
                message: "response carried no message".to_string(),
            })?;
        let message = GeneratedMessage {
            lead_id: req.lead_id,
            channel: req.channel,
            message: text.to_string(),
        };
        self.cache.set(key, serde_json::to_value(&message)?);
        Ok(message)
    }

    // ---------------------------------------------------------------
    // Failed operations, locks, status
    // ---------------------------------------------------------------

    pub fn list_failed(&self) -> Vec<FailedOperation> {
        self.failed_ops.list()
    }

    /// Replay a failed write now, whatever its class or status.
    pub async fn retry_failed(&self, id: &str) -> Result<serde_json::Value> {
        self.ensure_open()?;
        let rec = self.failed_ops.reset_for_manual_retry(id)?;
        let result = self.retry.attempt(&rec).await;
        if matches!(result, Err(SyncError::LeaseHeld { .. })) {
            // Left due now; let the worker pick it up once the lease frees
            self.failed_ops.wake();
        }
        result
    }

    pub fn dismiss_failed(&self, id: &str) -> Result<FailedOperation> {
        let removed = self
            .failed_ops
            .remove(id)?
            .ok_or_else(|| SyncError::FailedOperationNotFound(id.to_string()))?;
        tracing::info!("[SYNC] dismissed failed {} ({})", removed.op, removed.id);
        Ok(removed)
    }

    pub fn locks(&self) -> Vec<Lease> {
        self.leases.list()
    }

    /// Drop cache entries matching `pattern`, or everything without one.
    pub fn invalidate_cache(&self, pattern: Option<&str>) -> Result<usize> {
        match pattern {
            Some(p) => self.cache.invalidate_pattern(p),
            None => {
                let n = self.cache.len();
                self.cache.clear();
                Ok(n)
            }
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.connectivity.is_online(),
            connectivity_transitions: self.connectivity.transitions(),
            pending_optimistic: self.optimistic.pending_count(),
            failed: self.failed_ops.counts(),
            cache: self.cache.stats(),
            active_leases: self.leases.active_count(),
            store_keys: self.store.keys(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Wall time on the injected clock.
    pub fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_ms() as i64).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::ScriptedBackend;
    use crate::clock::ManualClock;
    use crate::types::{LeadStage, TaskChannel};
    use serde_json::json;
    use tempfile::TempDir;

    struct Rig {
        _tmp: TempDir,
        clock: Arc<ManualClock>,
        backend: Arc<ScriptedBackend>,
        sync: Arc<SyncManager<ScriptedBackend>>,
    }

    fn rig() -> Rig {
        let tmp = TempDir::new().unwrap();
        let clock = ManualClock::new(1_700_000_000_000);
        let backend = Arc::new(ScriptedBackend::new());
        let sync = SyncManager::open_with_clock(
            SyncConfig::for_tests(tmp.path()),
            Arc::clone(&backend),
            clock.clone(),
        )
        .unwrap();
        Rig {
            _tmp: tmp,
            clock,
            backend,
            sync,
        }
    }

    fn new_lead(name: &str) -> NewLead {
        serde_json::from_value(json!({ "name": name, "phone": "+34 600 000 000" })).unwrap()
    }

    fn network() -> BackendError {
        BackendError::Network("connection reset".into())
    }

    #[tokio::test]
    async fn test_list_fetches_then_serves_from_cache() {
        let r = rig();
        r.backend.push(
            WebhookOp::GetLeads,
            Ok(json!([{"id": "L1", "name": "Ana"}, {"id": "L2", "name": "Ben"}])),
        );

        let first = r.sync.list_leads().await.unwrap();
        assert_eq!(first.source, ListingSource::Backend);
        assert_eq!(first.items.len(), 2);

        let second = r.sync.list_leads().await.unwrap();
        assert_eq!(second.source, ListingSource::Cache);
        assert!(!second.stale);
        assert_eq!(r.backend.call_count(WebhookOp::GetLeads), 1);

        // Past the two-minute TTL the backend is asked again
        r.clock.advance_ms(120_000);
        r.backend.push(WebhookOp::GetLeads, Ok(json!({"leads": []})));
        let third = r.sync.list_leads().await.unwrap();
        assert_eq!(third.source, ListingSource::Backend);
        assert!(third.items.is_empty());
    }

    #[tokio::test]
    async fn test_list_falls_back_to_store_when_backend_fails() {
        let r = rig();
        r.backend
            .push(WebhookOp::GetAgents, Ok(json!([{"id": "A1", "name": "Eva"}])));
        r.sync.list_agents().await.unwrap();

        r.clock.advance_ms(120_000);
        r.backend.push(WebhookOp::GetAgents, Err(network()));
        let listing = r.sync.list_agents().await.unwrap();
        assert!(listing.stale);
        assert_eq!(listing.source, ListingSource::Store);
        assert_eq!(listing.items[0].name, "Eva");
        assert!(!r.sync.connectivity().is_online());
    }

    #[tokio::test]
    async fn test_list_with_nothing_local_surfaces_error() {
        let r = rig();
        r.backend.push(
            WebhookOp::GetTasks,
            Err(BackendError::Http {
                status: 500,
                body: "boom".into(),
            }),
        );
        let err = r.sync.list_tasks().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Backend {
                kind: FailureKind::Server,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_list_leads_resolves_duplicate_ids() {
        let r = rig();
        r.backend.push(
            WebhookOp::GetLeads,
            Ok(json!([
                {"id": "L1", "name": "old", "updatedAt": "2026-01-01T00:00:00Z"},
                {"id": "L1", "name": "new", "updatedAt": "2026-02-01T00:00:00Z"}
            ])),
        );
        let listing = r.sync.list_leads().await.unwrap();
        assert_eq!(listing.items[0].id, "L1-dup-1");
        assert_eq!(listing.items[1].id, "L1");
        let stored: Vec<Lead> = r.sync.store().load_collection().unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_undated_leads_keep_order_and_stay_undated() {
        let r = rig();
        let payload = json!([
            {"id": "L1", "name": "first"},
            {"id": "L1", "name": "second"}
        ]);
        r.backend.push(WebhookOp::GetLeads, Ok(payload.clone()));
        let listing = r.sync.list_leads().await.unwrap();
        assert_eq!(listing.items[0].id, "L1");
        assert_eq!(listing.items[0].name, "first");
        assert_eq!(listing.items[1].id, "L1-dup-1");

        let stored: Vec<Lead> = r.sync.store().load_collection().unwrap();
        assert!(stored.iter().all(|l| l.created_at.is_none() && l.updated_at.is_none()));

        // Refetching the same payload stores the same snapshot
        r.clock.advance_ms(120_000);
        r.backend.push(WebhookOp::GetLeads, Ok(payload));
        let again = r.sync.list_leads().await.unwrap();
        assert_eq!(again.source, ListingSource::Backend);
        let restored: Vec<Lead> = r.sync.store().load_collection().unwrap();
        assert_eq!(restored, stored);
        assert!(find_changes(&stored, &again.items).is_empty());
    }

    #[tokio::test]
    async fn test_old_snapshot_is_not_served() {
        let r = rig();
        r.backend
            .push(WebhookOp::GetAgents, Ok(json!([{"id": "A1", "name": "Eva"}])));
        r.sync.list_agents().await.unwrap();
        r.sync.cache().clear();

        r.clock.advance_ms(24 * 60 * 60 * 1000 - 1);
        r.backend.push(WebhookOp::GetAgents, Err(network()));
        let listing = r.sync.list_agents().await.unwrap();
        assert_eq!(listing.source, ListingSource::Store);

        r.clock.advance_ms(1);
        r.backend.push(WebhookOp::GetAgents, Err(network()));
        let err = r.sync.list_agents().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Backend {
                kind: FailureKind::Network,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_corrupt_stale_cache_is_a_server_error() {
        let r = rig();
        r.sync.connectivity().set_online(false);
        let key = cache_key(WebhookOp::GetTasks.as_str(), &json!({}));
        r.sync.cache().set(key, json!({"not": "a list"}));
        r.clock.advance_ms(120_000);

        let err = r.sync.list_tasks().await.unwrap_err();
        assert!(matches!(err, SyncError::Corrupt(_)));
        assert_eq!(err.status_code(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_create_lead_confirms_and_invalidates_cache() {
        let r = rig();
        r.backend.push(WebhookOp::GetLeads, Ok(json!([])));
        r.sync.list_leads().await.unwrap();
        assert_eq!(r.sync.cache().len(), 1);

        let written = r.sync.create_lead(new_lead("Marta")).await.unwrap();
        assert!(!written.is_queued());
        let lead = written.record;
        assert!(lead.id.starts_with("lead_"));
        // Stamped from the injected clock
        assert_eq!(
            lead.created_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert_eq!(r.sync.store().get_record::<Lead>(&lead.id).unwrap().unwrap().name, "Marta");
        assert!(r.sync.cache().is_empty());
        assert_eq!(r.sync.optimistic().pending_count(), 0);
        assert!(r.sync.locks().is_empty());

        let calls = r.backend.calls.lock().unwrap();
        let (op, payload) = calls.last().unwrap();
        assert_eq!(*op, WebhookOp::CreateLead);
        assert_eq!(payload["id"], json!(lead.id));
    }

    #[tokio::test]
    async fn test_backend_echo_replaces_local_record() {
        let r = rig();
        r.sync
            .store()
            .upsert_record(&serde_json::from_value::<Lead>(json!({"id": "L1", "name": "Ana"})).unwrap())
            .unwrap();
        r.backend.push(
            WebhookOp::UpdateLead,
            Ok(json!({"data": {"id": "L1", "name": "Ana", "stage": "Qualified", "notes": "server note"}})),
        );
        let patch = LeadPatch {
            stage: Some(LeadStage::Contacted),
            ..Default::default()
        };
        let lead = r.sync.update_lead("L1", patch).await.unwrap().record;
        assert_eq!(lead.stage, LeadStage::Qualified);
        assert_eq!(lead.notes.as_deref(), Some("server note"));
    }

    #[tokio::test]
    async fn test_rejected_update_rolls_back_and_is_recorded() {
        let r = rig();
        let original: Lead =
            serde_json::from_value(json!({"id": "L1", "name": "Ana", "stage": "New"})).unwrap();
        r.sync.store().upsert_record(&original).unwrap();
        r.backend.push(
            WebhookOp::UpdateLead,
            Err(BackendError::Http {
                status: 422,
                body: "stage not allowed".into(),
            }),
        );

        let patch = LeadPatch {
            stage: Some(LeadStage::Closed),
            ..Default::default()
        };
        let err = r.sync.update_lead("L1", patch).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Backend {
                kind: FailureKind::Validation,
                ..
            }
        ));

        let stored: Lead = r.sync.store().get_record("L1").unwrap().unwrap();
        assert_eq!(stored.stage, LeadStage::New);
        let failed = r.sync.list_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, FailureKind::Validation);
        assert_eq!(failed[0].dedup_key.as_deref(), Some("updateLead:L1"));
        assert!(failed[0].next_retry_at_ms.is_none());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_change_and_queues() {
        let r = rig();
        r.backend.push(WebhookOp::CreateLead, Err(network()));

        let written = r.sync.create_lead(new_lead("Nico")).await.unwrap();
        assert_eq!(written.record.name, "Nico");
        assert!(written.record.id.starts_with("lead_"));

        let leads: Vec<Lead> = r.sync.store().load_collection().unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0], written.record);
        let failed = r.sync.list_failed();
        assert_eq!(written.queued_as.as_deref(), Some(failed[0].id.as_str()));
        assert_eq!(failed[0].payload["id"], json!(written.record.id));
        assert_eq!(failed[0].kind, FailureKind::Network);
        assert!(failed[0].next_retry_at_ms.is_some());
        assert!(!r.sync.status().online);
    }

    #[tokio::test]
    async fn test_offline_write_skips_backend() {
        let r = rig();
        r.sync.connectivity().set_online(false);
        let queued = r.sync.delete_agent("A1").await.unwrap();
        assert_eq!(r.backend.call_count(WebhookOp::DeleteAgent), 0);
        assert_eq!(r.sync.failed_ops().len(), 1);
        assert_eq!(queued, Some(r.sync.list_failed()[0].id.clone()));
    }

    #[tokio::test]
    async fn test_same_write_in_flight_is_a_duplicate() {
        let r = rig();
        let _held = r
            .sync
            .leases()
            .acquire("deleteLead:L1", "other-tab", None)
            .unwrap();
        let err = r.sync.delete_lead("L1").await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateOperation(ref k) if k == "deleteLead:L1"));
        assert_eq!(r.backend.call_count(WebhookOp::DeleteLead), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_keeps_its_lease() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .delay_ms
            .store(60_000, std::sync::atomic::Ordering::SeqCst);
        let sync = SyncManager::open_with_clock(
            SyncConfig::for_tests(tmp.path()),
            Arc::clone(&backend),
            crate::clock::TokioClock::new(1_700_000_000_000),
        )
        .unwrap();

        let first = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.delete_lead("L1").await })
        };
        // Past the 30s lease TTL while the first call is still in flight
        tokio::time::sleep(Duration::from_secs(31)).await;
        let err = sync.delete_lead("L1").await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateOperation(ref k) if k == "deleteLead:L1"));

        assert_eq!(first.await.unwrap().unwrap(), None);
        assert_eq!(backend.call_count(WebhookOp::DeleteLead), 1);
        assert!(sync.locks().is_empty());
    }

    #[tokio::test]
    async fn test_complete_task_requires_known_task() {
        let r = rig();
        assert!(matches!(
            r.sync.complete_task("nope").await,
            Err(SyncError::NotFound { .. })
        ));

        let task = r
            .sync
            .schedule_task(NewTask {
                lead_id: "L1".into(),
                channel: TaskChannel::WhatsApp,
                scheduled_at: Utc::now(),
                message: None,
            })
            .await
            .unwrap()
            .record;
        assert_eq!(task.created_at, Some(r.sync.now_utc()));
        let done = r.sync.complete_task(&task.id).await.unwrap().record;
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_generate_message_is_cached() {
        let r = rig();
        r.backend.push(
            WebhookOp::GenerateMessage,
            Ok(json!({"message": "Hola Ana, ¿seguimos con la visita?"})),
        );
        let req: MessageRequest =
            serde_json::from_value(json!({"leadId": "L1", "channel": "whatsapp"})).unwrap();

        let first = r.sync.generate_message(req.clone()).await.unwrap();
        let second = r.sync.generate_message(req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(r.backend.call_count(WebhookOp::GenerateMessage), 1);
    }

    #[tokio::test]
    async fn test_manual_retry_and_dismiss() {
        let r = rig();
        r.backend.push(
            WebhookOp::DeleteLead,
            Err(BackendError::Http {
                status: 500,
                body: "down".into(),
            }),
        );
        let _ = r.sync.delete_lead("L1").await;
        let _ = r.sync.delete_lead("L2").await;
        // Second delete succeeded with the default response
        let failed = r.sync.list_failed();
        assert_eq!(failed.len(), 1);

        r.sync.retry_failed(&failed[0].id).await.unwrap();
        assert!(r.sync.list_failed().is_empty());

        assert!(matches!(
            r.sync.dismiss_failed(&failed[0].id),
            Err(SyncError::FailedOperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks_and_rejects_calls() {
        let r = rig();
        r.sync.start().unwrap();
        r.sync.start().unwrap();
        r.sync.shutdown().await;
        assert!(matches!(r.sync.list_leads().await, Err(SyncError::ShutDown)));
        assert!(matches!(r.sync.start(), Err(SyncError::ShutDown)));
    }

    #[tokio::test]
    async fn test_status_reports_parts() {
        let r = rig();
        r.sync.connectivity().set_online(false);
        let _ = r.sync.delete_lead("L1").await;
        let status = r.sync.status();
        assert!(!status.online);
        assert_eq!(status.failed.total, 1);
        assert_eq!(status.failed.network, 1);
        assert_eq!(status.active_leases, 0);
    }
}
