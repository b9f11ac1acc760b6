use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::detect::DetectError;
use crate::enforce::EnforceError;

/// Handler failure, rendered as `{"error": ..}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::Internal(m) => {
                error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        match e {
            DetectError::InvalidPolicy(_) => ApiError::Unprocessable(e.to_string()),
            DetectError::PolicyNotFound(_) | DetectError::IncidentNotFound(_) => ApiError::NotFound(e.to_string()),
            DetectError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            DetectError::Store(ref inner) if is_constraint(inner) => ApiError::Conflict(e.to_string()),
            DetectError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<EnforceError> for ApiError {
    fn from(e: EnforceError) -> Self {
        match e {
            EnforceError::UnknownActionType(_) | EnforceError::InvalidParams { .. } => {
                ApiError::Unprocessable(e.to_string())
            }
            EnforceError::ActionNotFound(_) => ApiError::NotFound(e.to_string()),
            // a dangling incident reference
            EnforceError::Store(ref inner) if is_constraint(inner) => ApiError::Unprocessable(e.to_string()),
            EnforceError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Unique-name clashes and similar constraint violations.
fn is_constraint(e: &crate::storage::StoreError) -> bool {
    matches!(
        e,
        crate::storage::StoreError::Sqlite(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    fn sqlite_failure(code: std::os::raw::c_int) -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None))
    }

    fn status(e: ApiError) -> StatusCode {
        e.into_response().status()
    }

    #[test]
    fn test_enforce_constraint_is_unprocessable() {
        let fk = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY);
        assert_eq!(status(EnforceError::Store(fk).into()), StatusCode::UNPROCESSABLE_ENTITY);

        let busy = sqlite_failure(rusqlite::ffi::SQLITE_BUSY);
        assert_eq!(status(EnforceError::Store(busy).into()), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_detect_constraint_is_conflict() {
        let unique = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE);
        assert_eq!(status(DetectError::Store(unique).into()), StatusCode::CONFLICT);
    }
}
