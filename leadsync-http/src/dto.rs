use axum::{http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub id: String,
    pub deleted_at: DateTime<Utc>,
    /// Failed-operation id when the backend was unreachable and the
    /// delete waits in the retry queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_as: Option<String>,
}

impl DeleteResponse {
    pub fn reply(
        id: String,
        deleted_at: DateTime<Utc>,
        queued_as: Option<String>,
    ) -> (StatusCode, Json<Self>) {
        let status = if queued_as.is_some() {
            StatusCode::ACCEPTED
        } else {
            StatusCode::OK
        };
        (
            status,
            Json(Self {
                id,
                deleted_at,
                queued_as,
            }),
        )
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct InvalidateCacheRequest {
    /// Regex over cache keys; every entry is dropped when absent.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InvalidateCacheResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RetryResponse {
    pub id: String,
    /// Backend response to the replayed write.
    pub result: serde_json::Value,
}
