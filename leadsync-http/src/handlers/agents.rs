use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use leadsync::{Agent, AgentPatch, Listing, NewAgent, SyncError};
use std::sync::Arc;

use super::{write_reply, AppState, WriteReply};
use crate::dto::DeleteResponse;

#[utoipa::path(
    get,
    path = "/api/agents",
    tag = "agents",
    responses(
        (status = 200, description = "Current agents", body = Listing<Agent>)
    )
)]
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Listing<Agent>>, SyncError> {
    Ok(Json(state.sync.list_agents().await?))
}

#[utoipa::path(
    post,
    path = "/api/agents",
    tag = "agents",
    request_body = NewAgent,
    responses(
        (status = 201, description = "Agent created", body = Agent),
        (status = 202, description = "Backend unreachable; the local record is returned with queuedAs set"),
        (status = 409, description = "The same create is already in flight")
    )
)]
pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewAgent>,
) -> WriteReply<Agent> {
    write_reply(state.sync.create_agent(input).await?, StatusCode::CREATED)
}

#[utoipa::path(
    put,
    path = "/api/agents/{id}",
    tag = "agents",
    params(("id" = String, Path, description = "Agent ID")),
    request_body = AgentPatch,
    responses(
        (status = 200, description = "Agent updated", body = Agent),
        (status = 202, description = "Backend unreachable; the local record is returned with queuedAs set"),
        (status = 404, description = "Agent not found")
    )
)]
pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<AgentPatch>,
) -> WriteReply<Agent> {
    write_reply(state.sync.update_agent(&id, patch).await?, StatusCode::OK)
}

#[utoipa::path(
    delete,
    path = "/api/agents/{id}",
    tag = "agents",
    params(("id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Agent deleted", body = DeleteResponse),
        (status = 202, description = "Backend unreachable, delete queued for retry", body = DeleteResponse),
        (status = 404, description = "Agent not found")
    )
)]
pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DeleteResponse>), SyncError> {
    let queued_as = state.sync.delete_agent(&id).await?;
    Ok(DeleteResponse::reply(id, state.sync.now_utc(), queued_as))
}
