use axum::{extract::State, Json};
use std::sync::Arc;

use super::AppState;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = serde_json::Value)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sync = &state.sync;
    let failed = sync.failed_ops().counts();

    Json(serde_json::json!({
        "status": "ok",
        "online": sync.connectivity().is_online(),
        "backend": sync.backend().config().base_url,
        "last_backend_success": sync.backend().last_success_timestamp(),
        "failed_operations": failed.total,
        "pending_optimistic": sync.optimistic().pending_count(),
        "cache_entries": sync.cache().len(),
        "build_profile": if cfg!(debug_assertions) { "debug" } else { "release" },
    }))
}
