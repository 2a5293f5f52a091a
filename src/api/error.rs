//! HTTP error mapping.
//!
//! Every handler error carries a kind from the platform taxonomy and is
//! rendered as `{"detail": <user_message>}` with the matching status.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{DatabaseError, ErrorKind};

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn permission_denied() -> Self {
        Self::new(ErrorKind::PermissionDenied, "not the owner of this resource")
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, detail)
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, detail)
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidState => StatusCode::CONFLICT,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::MissingContext | ErrorKind::ExecutionError | ErrorKind::TransportException => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = %self.kind, "request failed: {}", self.detail);
        }
        (status, Json(serde_json::json!({"detail": self.detail}))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(what) => ApiError::not_found(what),
            DatabaseError::UniqueViolation(detail) => {
                ApiError::new(ErrorKind::InvalidState, detail)
            }
            other => ApiError::new(ErrorKind::ExecutionError, other.to_string()),
        }
    }
}

impl From<crate::error::ConciergeError> for ApiError {
    fn from(err: crate::error::ConciergeError) -> Self {
        match err {
            crate::error::ConciergeError::CourseNotFound(id) => {
                ApiError::not_found(format!("course {id}"))
            }
            crate::error::ConciergeError::NotDeferred { course_id, status } => {
                ApiError::invalid_state(format!("course {course_id} is not deferred ({status})"))
            }
            crate::error::ConciergeError::Database(e) => e.into(),
            other => ApiError::new(ErrorKind::ExecutionError, other.to_string()),
        }
    }
}

impl From<crate::error::QueueError> for ApiError {
    fn from(err: crate::error::QueueError) -> Self {
        match err {
            crate::error::QueueError::UnknownJob(job) => {
                ApiError::not_found(format!("job {job}"))
            }
            crate::error::QueueError::Database(e) => e.into(),
            other => ApiError::new(ErrorKind::ExecutionError, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(ApiError::validation("x").status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::not_found("y").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::permission_denied().status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::invalid_state("z").status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::new(ErrorKind::RateLimited, "slow down").status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::new(ErrorKind::MissingContext, "no creds").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn database_not_found_maps_to_404() {
        let api: ApiError = DatabaseError::NotFound("thread 9".to_string()).into();
        assert_eq!(api.status(), StatusCode::NOT_FOUND);
    }
}
