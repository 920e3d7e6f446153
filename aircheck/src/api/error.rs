//! API error handling.
//!
//! Every handler failure renders as `{"error":{"kind":…,"message":…}}`
//! with the status mapped from the application error kind.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

/// Application error adapted to an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::UpstreamUnavailable(_) | Error::UpstreamMalformed(_) => StatusCode::BAD_GATEWAY,
            // Client-closed-request; never actually rendered to users.
            Error::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Error::CaptureFailed(_) | Error::StorageIo { .. } | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_kind_mapping() {
        let cases = [
            (Error::bad_request("x"), 400),
            (Error::not_found("reservation", "1"), 404),
            (Error::conflict("dup"), 409),
            (Error::UpstreamUnavailable("down".to_string()), 502),
            (Error::UpstreamMalformed("bad".to_string()), 502),
            (Error::CaptureFailed("short".to_string()), 500),
            (Error::Canceled, 499),
            (Error::internal("boom"), 500),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError(error).status().as_u16(), expected);
        }
    }
}
