use axum::{
    extract::{Path, State},
    Json,
};
use leadsync::{FailedOperation, Lease, SyncError, SyncStatus};
use std::sync::Arc;

use super::AppState;
use crate::dto::RetryResponse;

#[utoipa::path(
    get,
    path = "/api/sync/status",
    tag = "sync",
    responses(
        (status = 200, description = "Sync layer status", body = SyncStatus)
    )
)]
pub async fn sync_status(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    Json(state.sync.status())
}

/// Writes the backend has not accepted yet, oldest first
#[utoipa::path(
    get,
    path = "/api/sync/failed",
    tag = "sync",
    responses(
        (status = 200, description = "Queued failed writes", body = Vec<FailedOperation>)
    )
)]
pub async fn list_failed(State(state): State<Arc<AppState>>) -> Json<Vec<FailedOperation>> {
    Json(state.sync.list_failed())
}

/// Replay a failed write immediately
#[utoipa::path(
    post,
    path = "/api/sync/failed/{id}/retry",
    tag = "sync",
    params(("id" = String, Path, description = "Failed operation ID")),
    responses(
        (status = 200, description = "Replay succeeded", body = RetryResponse),
        (status = 202, description = "Backend still unreachable, kept in queue"),
        (status = 404, description = "Failed operation not found"),
        (status = 409, description = "A replay of this write is already in flight")
    )
)]
pub async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, SyncError> {
    let result = state.sync.retry_failed(&id).await?;
    Ok(Json(RetryResponse { id, result }))
}

/// Drop a failed write without replaying it
#[utoipa::path(
    delete,
    path = "/api/sync/failed/{id}",
    tag = "sync",
    params(("id" = String, Path, description = "Failed operation ID")),
    responses(
        (status = 200, description = "Failed operation dismissed", body = FailedOperation),
        (status = 404, description = "Failed operation not found")
    )
)]
pub async fn dismiss_failed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FailedOperation>, SyncError> {
    Ok(Json(state.sync.dismiss_failed(&id)?))
}

#[utoipa::path(
    get,
    path = "/api/sync/locks",
    tag = "sync",
    responses(
        (status = 200, description = "Leases currently held", body = Vec<Lease>)
    )
)]
pub async fn list_locks(State(state): State<Arc<AppState>>) -> Json<Vec<Lease>> {
    Json(state.sync.locks())
}
