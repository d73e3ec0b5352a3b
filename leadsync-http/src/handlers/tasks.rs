use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use leadsync::{FollowUpTask, Listing, NewTask, SyncError};
use std::sync::Arc;

use super::{write_reply, AppState, WriteReply};

#[utoipa::path(
    get,
    path = "/api/tasks",
    tag = "tasks",
    responses(
        (status = 200, description = "Scheduled follow-ups", body = Listing<FollowUpTask>)
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Listing<FollowUpTask>>, SyncError> {
    Ok(Json(state.sync.list_tasks().await?))
}

/// Schedule a follow-up for a lead
#[utoipa::path(
    post,
    path = "/api/tasks",
    tag = "tasks",
    request_body = NewTask,
    responses(
        (status = 201, description = "Follow-up scheduled", body = FollowUpTask),
        (status = 202, description = "Backend unreachable; the local record is returned with queuedAs set"),
        (status = 409, description = "A follow-up for this lead is already being scheduled")
    )
)]
pub async fn schedule_task(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewTask>,
) -> WriteReply<FollowUpTask> {
    write_reply(state.sync.schedule_task(input).await?, StatusCode::CREATED)
}

#[utoipa::path(
    post,
    path = "/api/tasks/{id}/complete",
    tag = "tasks",
    params(("id" = String, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Follow-up completed", body = FollowUpTask),
        (status = 202, description = "Backend unreachable; the local record is returned with queuedAs set"),
        (status = 404, description = "Task not found")
    )
)]
pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> WriteReply<FollowUpTask> {
    write_reply(state.sync.complete_task(&id).await?, StatusCode::OK)
}
