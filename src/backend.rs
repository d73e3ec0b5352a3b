//! The seam between the sync layer and the webhook automation backend.
//!
//! Every remote call goes through [`Backend::call`] with a [`WebhookOp`] and
//! a JSON payload. The backend's business logic is opaque; the only things
//! the sync layer relies on are the operation names and the error shape.

use crate::failed_ops::FailureKind;
use crate::types::Collection;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// A webhook endpoint exposed by the automation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebhookOp {
    GetLeads,
    CreateLead,
    UpdateLead,
    DeleteLead,
    GetAgents,
    CreateAgent,
    UpdateAgent,
    DeleteAgent,
    GetTasks,
    ScheduleTask,
    CompleteTask,
    GetNotifications,
    MarkNotificationRead,
    GenerateMessage,
}

impl WebhookOp {
    pub const ALL: [WebhookOp; 14] = [
        WebhookOp::GetLeads,
        WebhookOp::CreateLead,
        WebhookOp::UpdateLead,
        WebhookOp::DeleteLead,
        WebhookOp::GetAgents,
        WebhookOp::CreateAgent,
        WebhookOp::UpdateAgent,
        WebhookOp::DeleteAgent,
        WebhookOp::GetTasks,
        WebhookOp::ScheduleTask,
        WebhookOp::CompleteTask,
        WebhookOp::GetNotifications,
        WebhookOp::MarkNotificationRead,
        WebhookOp::GenerateMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOp::GetLeads => "getLeads",
            WebhookOp::CreateLead => "createLead",
            WebhookOp::UpdateLead => "updateLead",
            WebhookOp::DeleteLead => "deleteLead",
            WebhookOp::GetAgents => "getAgents",
            WebhookOp::CreateAgent => "createAgent",
            WebhookOp::UpdateAgent => "updateAgent",
            WebhookOp::DeleteAgent => "deleteAgent",
            WebhookOp::GetTasks => "getTasks",
            WebhookOp::ScheduleTask => "scheduleTask",
            WebhookOp::CompleteTask => "completeTask",
            WebhookOp::GetNotifications => "getNotifications",
            WebhookOp::MarkNotificationRead => "markNotificationRead",
            WebhookOp::GenerateMessage => "generateMessage",
        }
    }

    /// Whether the operation changes backend state. Mutations go through
    /// the lease/optimistic/retry path; reads go through the cache.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            WebhookOp::GetLeads
                | WebhookOp::GetAgents
                | WebhookOp::GetTasks
                | WebhookOp::GetNotifications
                | WebhookOp::GenerateMessage
        )
    }

    /// The locally mirrored collection this operation reads or writes.
    pub fn collection(&self) -> Option<Collection> {
        match self {
            WebhookOp::GetLeads
            | WebhookOp::CreateLead
            | WebhookOp::UpdateLead
            | WebhookOp::DeleteLead => Some(Collection::Leads),
            WebhookOp::GetAgents
            | WebhookOp::CreateAgent
            | WebhookOp::UpdateAgent
            | WebhookOp::DeleteAgent => Some(Collection::Agents),
            WebhookOp::GetTasks | WebhookOp::ScheduleTask | WebhookOp::CompleteTask => {
                Some(Collection::Tasks)
            }
            WebhookOp::GetNotifications | WebhookOp::MarkNotificationRead => {
                Some(Collection::Notifications)
            }
            WebhookOp::GenerateMessage => None,
        }
    }
}

impl std::fmt::Display for WebhookOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WebhookOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WebhookOp::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown webhook operation: {}", s))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("webhook returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("could not decode webhook response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Map the error onto the failure classes the retry queue understands.
    pub fn classify(&self) -> FailureKind {
        match self {
            BackendError::Network(_) | BackendError::Timeout(_) => FailureKind::Network,
            BackendError::Http { status, .. } => match *status {
                // Request timeout and rate limiting are transient
                408 | 429 => FailureKind::Network,
                400..=499 => FailureKind::Validation,
                500..=599 => FailureKind::Server,
                _ => FailureKind::Unknown,
            },
            BackendError::Decode(_) => FailureKind::Unknown,
        }
    }
}

/// Remote API the sync layer talks to.
///
/// Implemented over HTTP by `leadsync-webhook`; tests use scripted
/// in-memory implementations.
pub trait Backend: Send + Sync + 'static {
    /// Invoke a webhook operation with a JSON payload.
    fn call(
        &self,
        op: WebhookOp,
        payload: &serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, BackendError>> + Send;

    /// Cheap reachability check used by the connectivity monitor.
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Backend that replays scripted responses per operation and records
    /// every call it receives.
    pub struct ScriptedBackend {
        responses: Mutex<Vec<(WebhookOp, VecDeque<Result<serde_json::Value, BackendError>>)>>,
        pub calls: Mutex<Vec<(WebhookOp, serde_json::Value)>>,
        pub reachable: AtomicBool,
        /// Sleep this long (tokio time) before answering each call.
        pub delay_ms: AtomicU64,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                delay_ms: AtomicU64::new(0),
            }
        }

        pub fn push(&self, op: WebhookOp, response: Result<serde_json::Value, BackendError>) {
            let mut responses = self.responses.lock().unwrap();
            if let Some((_, queue)) = responses.iter_mut().find(|(o, _)| *o == op) {
                queue.push_back(response);
            } else {
                responses.push((op, VecDeque::from([response])));
            }
        }

        pub fn call_count(&self, op: WebhookOp) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(o, _)| *o == op)
                .count()
        }
    }

    impl Backend for ScriptedBackend {
        async fn call(
            &self,
            op: WebhookOp,
            payload: &serde_json::Value,
        ) -> Result<serde_json::Value, BackendError> {
            self.calls.lock().unwrap().push((op, payload.clone()));
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            let mut responses = self.responses.lock().unwrap();
            responses
                .iter_mut()
                .find(|(o, _)| *o == op)
                .and_then(|(_, queue)| queue.pop_front())
                .unwrap_or_else(|| Ok(serde_json::json!({"success": true})))
        }

        async fn probe(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }
}
