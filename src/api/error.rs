/// HTTP rendering of lifecycle errors
///
/// Every failure is returned as `{"error": {"code", "status", "message"}}` with
/// `code` the HTTP status and `status` the canonical error name.

use crate::error::{ErrorCode, LifecycleError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

/// Non-standard status used for client-cancelled requests
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug)]
pub struct ApiError(pub LifecycleError);

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        ApiError(error)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument | ErrorCode::FailedPrecondition => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists | ErrorCode::Aborted => StatusCode::CONFLICT,
        ErrorCode::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = status_for(code);

        let message = match code {
            ErrorCode::Internal => {
                tracing::error!("Request failed: {}", self.0);
                "internal error".to_string()
            }
            _ => {
                tracing::debug!("Request rejected: {}", self.0);
                self.0.to_string()
            }
        };

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "status": code,
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_codes() {
        assert_eq!(status_for(ErrorCode::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::FailedPrecondition), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::Cancelled).as_u16(), 499);
        assert_eq!(status_for(ErrorCode::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let response = ApiError(LifecycleError::Internal("disk on fire".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
