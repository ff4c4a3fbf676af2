//! Structured JSON bodies for user-visible failures.
//!
//! DESIGN
//! ======
//! Every error the service surfaces to a caller (rate-limit denials, dead
//! pools, proxy failures, admin API errors) carries the same JSON shape:
//! `{"code": <status>, "message": <text>}`. Internal error details never
//! leak into the body; they go to the log instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

/// Wire format for error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// HTTP status code, duplicated into the body.
    pub code: u16,
    pub message: String,
}

/// Build a JSON error response with the standard body.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    let body = ErrorBody { code: status.as_u16(), message };
    (status, Json(body)).into_response()
}

#[cfg(test)]
#[path = "response_test.rs"]
mod tests;
