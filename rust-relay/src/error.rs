//! Error taxonomy and its translation into HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Errors surfaced by the request pipeline.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed JSON, missing or invalid email, invalid status.
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,

    /// The SparkLoop call failed; carries the remote detail.
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Method not allowed. Only GET and POST requests are supported.")]
    MethodNotAllowed,

    /// The event store failed on a read path. The message is the public one.
    #[error("{0}")]
    Store(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::Store(_) | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Build the `{error, timestamp, details?}` body used on every failure path.
pub fn error_body(message: &str, details: Option<Value>) -> Value {
    let mut body = json!({
        "error": message,
        "timestamp": now_rfc3339(),
    });
    if let Some(details) = details {
        body["details"] = details;
    }
    body
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            RelayError::Upstream(detail) => error_body(
                "Failed to update subscriber in SparkLoop",
                Some(json!({ "sparkloop_error": detail })),
            ),
            RelayError::Internal(err) => {
                let error_id = Uuid::new_v4().to_string();
                error!(error_id = %error_id, error = ?err, "request_internal_error");
                error_body(
                    "Internal server error",
                    Some(json!({ "error_id": error_id })),
                )
            }
            other => error_body(&other.to_string(), None),
        };

        (status, Json(body)).into_response()
    }
}
