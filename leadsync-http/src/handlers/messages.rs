use axum::{extract::State, Json};
use leadsync::{GeneratedMessage, MessageRequest, SyncError};
use std::sync::Arc;

use super::AppState;

/// Ask the backend to draft an outreach message for a lead
#[utoipa::path(
    post,
    path = "/api/messages/generate",
    tag = "messages",
    request_body = MessageRequest,
    responses(
        (status = 200, description = "Drafted message", body = GeneratedMessage),
        (status = 503, description = "Backend unreachable")
    )
)]
pub async fn generate_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<GeneratedMessage>, SyncError> {
    Ok(Json(state.sync.generate_message(req).await?))
}
