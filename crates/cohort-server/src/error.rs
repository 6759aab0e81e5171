//! HTTP error bodies: `{ "ok": false, "code": ..., "message": ... }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use cohort_types::{CohortError, ErrorClass};

#[derive(Debug)]
pub enum ApiError {
    Cohort(CohortError),
    /// A query or body value that could not be parsed.
    BadRequest(String),
    /// The admin surface is switched off (no password configured).
    AdminDisabled,
}

impl From<CohortError> for ApiError {
    fn from(e: CohortError) -> Self {
        ApiError::Cohort(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Cohort(e) => {
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::AdminDisabled => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Cohort(e) => e.code(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::AdminDisabled => "admin_disabled",
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Cohort(e) => write!(f, "{e}"),
            ApiError::BadRequest(msg) => write!(f, "{msg}"),
            ApiError::AdminDisabled => write!(f, "admin summary is disabled"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        match &self {
            ApiError::Cohort(e) if e.class() != ErrorClass::Protocol => {
                tracing::error!(code = e.code(), error = %e, "Request failed");
            }
            _ => tracing::warn!(code = self.code(), status = status.as_u16(), %message, "Request rejected"),
        }
        let body = json!({
            "ok": false,
            "code": self.code(),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}
