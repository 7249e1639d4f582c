//! Crate-wide error type and HTTP mapping.
//!
//! Every fallible operation in the hub returns [`HubError`]. The enum mirrors
//! the API error contract: each variant carries a human-readable sentence and
//! maps to a machine-readable code plus an HTTP status.
//!
//! | Variant | Code | Status |
//! |---------|------|--------|
//! | `InvalidRequest` | `bad_request` | 400 |
//! | `Unauthorized` | `unauthorized` | 401 |
//! | `Forbidden` | `forbidden` | 403 |
//! | `NotFound` | `not_found` | 404 |
//! | `Conflict` | `conflict` | 409 |
//! | `RemoteFailure` | `remote_failure` | 502 |
//! | `RemoteTimeout` | `remote_timeout` | 504 |
//! | `Integrity` | `integrity_error` | 500 |
//! | `Transient` | `transient` | 503 |
//!
//! Per-step install failures and per-manifest ingest failures are recorded as
//! data (`StepResult`, ingest outcome error lists), not raised through this
//! type. Stack traces and driver-level detail never cross the HTTP boundary:
//! `sqlx` and `reqwest` errors are logged at the call site and collapsed into
//! the matching variant here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RemoteFailure(String),

    #[error("{0}")]
    RemoteTimeout(String),

    #[error("{0}")]
    Integrity(String),

    #[error("{0}")]
    Transient(String),
}

impl HubError {
    /// Machine-readable code included in every error response body.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::InvalidRequest(_) => "bad_request",
            HubError::Unauthorized(_) => "unauthorized",
            HubError::Forbidden(_) => "forbidden",
            HubError::NotFound(_) => "not_found",
            HubError::Conflict(_) => "conflict",
            HubError::RemoteFailure(_) => "remote_failure",
            HubError::RemoteTimeout(_) => "remote_timeout",
            HubError::Integrity(_) => "integrity_error",
            HubError::Transient(_) => "transient",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HubError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HubError::Forbidden(_) => StatusCode::FORBIDDEN,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::RemoteFailure(_) => StatusCode::BAD_GATEWAY,
            HubError::RemoteTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HubError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HubError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<sqlx::Error> for HubError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => HubError::NotFound("record not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                HubError::Conflict("unique key violated".to_string())
            }
            _ => {
                tracing::error!(error = %e, "database error");
                HubError::Integrity("a storage constraint was violated unexpectedly".to_string())
            }
        }
    }
}

impl From<reqwest::Error> for HubError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HubError::RemoteTimeout(format!("upstream call timed out: {}", redact_url(&e)))
        } else {
            HubError::RemoteFailure(format!("upstream call failed: {}", redact_url(&e)))
        }
    }
}

/// `reqwest` errors embed the full request URL, which may carry credentials
/// in userinfo position. Strip to host before surfacing.
fn redact_url(e: &reqwest::Error) -> String {
    match e.url() {
        Some(u) => format!("{} ({})", u.host_str().unwrap_or("unknown host"), kind_of(e)),
        None => kind_of(e).to_string(),
    }
}

fn kind_of(e: &reqwest::Error) -> &'static str {
    if e.is_connect() {
        "connect error"
    } else if e.is_timeout() {
        "timeout"
    } else if e.is_decode() {
        "decode error"
    } else {
        "request error"
    }
}

// ============ HTTP response body ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        assert_eq!(HubError::InvalidRequest("x".into()).code(), "bad_request");
        assert_eq!(HubError::Conflict("x".into()).code(), "conflict");
        assert_eq!(HubError::RemoteTimeout("x".into()).code(), "remote_timeout");
    }

    #[test]
    fn statuses_follow_contract() {
        assert_eq!(
            HubError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HubError::RemoteFailure("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            HubError::Integrity("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
