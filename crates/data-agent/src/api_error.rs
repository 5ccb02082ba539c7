//! JSON error responses.

use std::fmt::Display;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

/// An error answered to the HTTP client.
///
/// Rendered as `{"message":{"reason":"…","advice":"…"}}`. Causes of
/// unexpected failures are logged, never sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub reason: String,
    pub advice: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: ErrorMessage<'a>,
}

#[derive(Serialize)]
struct ErrorMessage<'a> {
    reason: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    advice: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            advice: String::new(),
        }
    }

    pub fn with_advice(mut self, advice: impl Into<String>) -> Self {
        self.advice = advice.into();
        self
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, reason)
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }

    /// A 500 whose `cause` goes to the log only.
    pub fn internal(cause: impl Display) -> Self {
        error!(error = %cause, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "unexpected error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            message: ErrorMessage {
                reason: &self.reason,
                advice: &self.advice,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
