use axum::{http::StatusCode, Json};
use leadsync::{SyncError, SyncManager, Written};
use leadsync_webhook::WebhookClient;
use std::sync::Arc;

pub mod agents;
pub mod cache;
pub mod health;
pub mod leads;
pub mod messages;
pub mod notifications;
pub mod sync;
pub mod tasks;

pub use agents::{create_agent, delete_agent, list_agents, update_agent};
pub use cache::invalidate_cache;
pub use health::health;
pub use leads::{create_lead, delete_lead, list_leads, update_lead};
pub use messages::generate_message;
pub use notifications::{list_notifications, mark_notification_read};
pub use sync::{dismiss_failed, list_failed, list_locks, retry_failed, sync_status};
pub use tasks::{complete_task, list_tasks, schedule_task};

pub struct AppState {
    pub sync: Arc<SyncManager<WebhookClient>>,
}

/// Reply to a write: the record as stored locally, with `queuedAs` set
/// when the backend could not be reached.
pub type WriteReply<T> = Result<(StatusCode, Json<Written<T>>), SyncError>;

/// 202 when the write was queued for retry, `ok` otherwise.
pub(crate) fn write_reply<T>(written: Written<T>, ok: StatusCode) -> WriteReply<T> {
    let status = if written.is_queued() {
        StatusCode::ACCEPTED
    } else {
        ok
    };
    Ok((status, Json(written)))
}
