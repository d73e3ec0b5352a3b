use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Failed operation not found: {0}")]
    FailedOperationNotFound(String),

    #[error("Operation already in flight: {0}")]
    DuplicateOperation(String),

    #[error("Optimistic update already pending: {0}")]
    AlreadyPending(String),

    #[error("Lease for {key} is held by {owner} until {expires_at_ms}")]
    LeaseHeld {
        key: String,
        owner: String,
        expires_at_ms: u64,
    },

    #[error("Stale lease token {token} for {key}")]
    StaleLease { key: String, token: u64 },

    #[error("Backend unreachable, operation queued: {0}")]
    Offline(String),

    #[error("Backend rejected {operation}: {message}")]
    Backend {
        operation: String,
        kind: crate::failed_ops::FailureKind,
        message: String,
    },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    /// Locally held data (store snapshot, cache entry) failed to decode.
    #[error("Stored data unreadable: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sync manager is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Json(e.to_string())
    }
}

impl From<regex::Error> for SyncError {
    fn from(e: regex::Error) -> Self {
        SyncError::InvalidPattern(e.to_string())
    }
}

impl SyncError {
    pub fn status_code(&self) -> StatusCode {
        use crate::failed_ops::FailureKind;
        match self {
            SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::FailedOperationNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::DuplicateOperation(_) => StatusCode::CONFLICT,
            SyncError::AlreadyPending(_) => StatusCode::CONFLICT,
            SyncError::LeaseHeld { .. } => StatusCode::CONFLICT,
            SyncError::StaleLease { .. } => StatusCode::CONFLICT,
            SyncError::Offline(_) => StatusCode::ACCEPTED,
            SyncError::Backend { kind, .. } => match kind {
                FailureKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                FailureKind::Network => StatusCode::SERVICE_UNAVAILABLE,
                FailureKind::Server | FailureKind::Unknown => StatusCode::BAD_GATEWAY,
            },
            SyncError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            SyncError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
            SyncError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::Json(_) => StatusCode::BAD_REQUEST,
            SyncError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// Axum IntoResponse implementation (feature-gated)
#[cfg(feature = "axum-support")]
use axum::response::{IntoResponse, Json, Response};
#[cfg(feature = "axum-support")]
use serde::Serialize;

#[cfg(feature = "axum-support")]
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[cfg(feature = "axum-support")]
impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_code, suggestion) = match &self {
            SyncError::NotFound { .. } => ("not_found", None),
            SyncError::FailedOperationNotFound(_) => (
                "failed_operation_not_found",
                Some("Failed operations expire 24 hours after they are recorded".to_string()),
            ),
            SyncError::DuplicateOperation(_) => (
                "duplicate_operation",
                Some("The same write is already in flight; wait for it to settle".to_string()),
            ),
            SyncError::AlreadyPending(_) => ("already_pending", None),
            SyncError::LeaseHeld { .. } => (
                "lease_held",
                Some("Retry after the lease expires".to_string()),
            ),
            SyncError::StaleLease { .. } => ("stale_lease", None),
            SyncError::Offline(_) => (
                "queued_offline",
                Some("The write will be retried once the backend is reachable".to_string()),
            ),
            SyncError::Backend { .. } => ("backend_error", None),
            SyncError::InvalidRecord(_) => ("invalid_record", None),
            SyncError::InvalidPattern(_) => ("invalid_pattern", None),
            SyncError::Io(_) => ("io_error", None),
            SyncError::Json(_) => ("json_error", None),
            SyncError::Corrupt(_) => (
                "corrupt_data",
                Some("Clear the local store and cache to refetch from the backend".to_string()),
            ),
            SyncError::Config(_) => ("config_error", None),
            SyncError::ShutDown => ("shut_down", None),
        };

        let error_response = ErrorResponse {
            error: error_code.to_string(),
            message: self.to_string(),
            request_id: format!("req_ls_{}", uuid::Uuid::new_v4()),
            suggestion,
        };

        let mut response = (status, Json(error_response)).into_response();
        if matches!(&self, SyncError::LeaseHeld { .. }) {
            response
                .headers_mut()
                .insert("Retry-After", http::HeaderValue::from_static("5"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_ops::FailureKind;

    #[test]
    fn test_backend_status_follows_failure_kind() {
        let err = SyncError::Backend {
            operation: "createLead".to_string(),
            kind: FailureKind::Validation,
            message: "phone missing".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let err = SyncError::Backend {
            operation: "createLead".to_string(),
            kind: FailureKind::Server,
            message: "boom".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_local_decode_failure_is_a_server_error() {
        assert_eq!(
            SyncError::Corrupt("store key leads".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SyncError::Json("bad body".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SyncError = io.into();
        assert!(matches!(err, SyncError::Io(ref m) if m.contains("gone")));
    }
}
