use axum::{extract::State, Json};
use leadsync::SyncError;
use std::sync::Arc;

use super::AppState;
use crate::dto::{InvalidateCacheRequest, InvalidateCacheResponse};

/// Drop cached reads matching a key pattern, or all of them
#[utoipa::path(
    post,
    path = "/api/cache/invalidate",
    tag = "cache",
    request_body = InvalidateCacheRequest,
    responses(
        (status = 200, description = "Entries removed", body = InvalidateCacheResponse),
        (status = 400, description = "Pattern is not a valid regex")
    )
)]
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    body: Option<Json<InvalidateCacheRequest>>,
) -> Result<Json<InvalidateCacheResponse>, SyncError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let removed = state.sync.invalidate_cache(req.pattern.as_deref())?;
    tracing::info!(
        "[CACHE] invalidated {} entries (pattern={:?})",
        removed,
        req.pattern
    );
    Ok(Json(InvalidateCacheResponse { removed }))
}
