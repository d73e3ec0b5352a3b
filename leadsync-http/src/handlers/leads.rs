use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use leadsync::{Lead, LeadPatch, Listing, NewLead, SyncError};
use std::sync::Arc;

use super::{write_reply, AppState, WriteReply};
use crate::dto::DeleteResponse;

/// List leads, falling back to the local snapshot when the backend is down
#[utoipa::path(
    get,
    path = "/api/leads",
    tag = "leads",
    responses(
        (status = 200, description = "Current leads", body = Listing<Lead>),
        (status = 502, description = "Backend failed and nothing is stored locally")
    )
)]
pub async fn list_leads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Listing<Lead>>, SyncError> {
    Ok(Json(state.sync.list_leads().await?))
}

/// Create a lead
#[utoipa::path(
    post,
    path = "/api/leads",
    tag = "leads",
    request_body = NewLead,
    responses(
        (status = 201, description = "Lead created", body = Lead),
        (status = 202, description = "Backend unreachable; the local record is returned with queuedAs set"),
        (status = 400, description = "Invalid lead"),
        (status = 409, description = "The same create is already in flight"),
        (status = 422, description = "Backend rejected the lead")
    )
)]
pub async fn create_lead(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewLead>,
) -> WriteReply<Lead> {
    write_reply(state.sync.create_lead(input).await?, StatusCode::CREATED)
}

/// Apply a partial update to a lead
#[utoipa::path(
    put,
    path = "/api/leads/{id}",
    tag = "leads",
    params(("id" = String, Path, description = "Lead ID")),
    request_body = LeadPatch,
    responses(
        (status = 200, description = "Lead updated", body = Lead),
        (status = 202, description = "Backend unreachable; the local record is returned with queuedAs set"),
        (status = 404, description = "Lead not found"),
        (status = 409, description = "Another write to this lead is in flight")
    )
)]
pub async fn update_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<LeadPatch>,
) -> WriteReply<Lead> {
    write_reply(state.sync.update_lead(&id, patch).await?, StatusCode::OK)
}

/// Delete a lead
#[utoipa::path(
    delete,
    path = "/api/leads/{id}",
    tag = "leads",
    params(("id" = String, Path, description = "Lead ID")),
    responses(
        (status = 200, description = "Lead deleted", body = DeleteResponse),
        (status = 202, description = "Backend unreachable, delete queued for retry", body = DeleteResponse),
        (status = 404, description = "Lead not found")
    )
)]
pub async fn delete_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DeleteResponse>), SyncError> {
    let queued_as = state.sync.delete_lead(&id).await?;
    Ok(DeleteResponse::reply(id, state.sync.now_utc(), queued_as))
}
