use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use leadsync::{Listing, Notification, SyncError};
use std::sync::Arc;

use super::{write_reply, AppState, WriteReply};

#[utoipa::path(
    get,
    path = "/api/notifications",
    tag = "notifications",
    responses(
        (status = 200, description = "Notifications", body = Listing<Notification>)
    )
)]
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Listing<Notification>>, SyncError> {
    Ok(Json(state.sync.list_notifications().await?))
}

#[utoipa::path(
    post,
    path = "/api/notifications/{id}/read",
    tag = "notifications",
    params(("id" = String, Path, description = "Notification ID")),
    responses(
        (status = 200, description = "Notification marked read", body = Notification),
        (status = 202, description = "Backend unreachable; the local record is returned with queuedAs set"),
        (status = 404, description = "Notification not found")
    )
)]
pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> WriteReply<Notification> {
    write_reply(state.sync.mark_notification_read(&id).await?, StatusCode::OK)
}
