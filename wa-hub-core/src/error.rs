//! The core error taxonomy. Variants are *kinds*, not one-error-per-
//! call-site — `wa-hub-server::infra::errors::AppError` maps each kind to an
//! HTTP status exactly once via a single `From` impl, rather than choosing a
//! status at every call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed request: {0}")]
    UserRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Instance is in a state that requires connectivity the instance
    /// doesn't have right now (NEEDS_QR / ERROR / RESTRICTED / FAILED_QR_TIMEOUT).
    #[error("instance is terminal: {0}")]
    Terminal(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Not really an error: the caller's idempotency key already resolved to
    /// a successful send. Surfaced as a 200 with `idempotent: true`, never
    /// logged as a failure.
    #[error("idempotency key already sent")]
    DuplicateIdempotent {
        provider_message_id: Option<String>,
    },

    /// Driver failure recovered by SendLoop + ReconnectionLadder; never
    /// surfaced synchronously to an API caller.
    #[error("transient driver failure: {0}")]
    TransientDriver(String),

    /// Driver failure that moves the instance to NEEDS_QR.
    #[error("persistent driver failure: {0}")]
    PersistentDriver(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
