//! `AppError`/`AppResult`: the axum-facing error wrapper — status, message,
//! and an `IntoResponse` impl, with `From` impls doing the upstream-error ->
//! HTTP-status mapping once rather than at every call site.

use std::fmt;

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;

use wa_hub_core::error::CoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Set for `CoreError::Terminal`: the client asked for something that
    /// requires connectivity the instance doesn't currently have.
    pub terminal: bool,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            terminal: false,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
                "terminal": self.terminal,
            }
        }));
        (self.status, body).into_response()
    }
}

/// Maps the core error taxonomy onto HTTP status codes exactly once.
impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UserRequest(msg) => Self::bad_request(msg),
            CoreError::NotFound(msg) => Self::not_found(msg),
            CoreError::Terminal(msg) => {
                let mut e = Self::bad_request(msg);
                e.terminal = true;
                e
            }
            CoreError::RateLimited(msg) => Self::rate_limited(msg),
            CoreError::DuplicateIdempotent { provider_message_id } => Self::conflict(format!(
                "idempotency key already sent (providerMessageId={})",
                provider_message_id.as_deref().unwrap_or("unknown")
            )),
            CoreError::TransientDriver(msg) => {
                tracing::warn!(error = %msg, "transient driver error reached the HTTP layer");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            CoreError::PersistentDriver(msg) => Self::bad_request(msg),
            CoreError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                Self::internal("internal error")
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "internal error");
        Self::internal(err.to_string())
    }
}
