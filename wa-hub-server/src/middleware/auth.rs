//! Bearer-token auth: a single shared operator secret, not per-user JWTs —
//! this supervisor has no user accounts to authenticate, just one operator
//! token guarding every endpoint but `/health`.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::infra::app_state::AppState;
use crate::infra::errors::AppError;

pub async fn require_bearer_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(&request)?;
    if token != state.config.api_token {
        return Err(AppError::unauthorized("invalid bearer token"));
    }
    Ok(next.run(request).await)
}

fn extract_bearer_token(request: &Request) -> Result<&str, AppError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing authorization header"))?;

    header_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::unauthorized("authorization header must use the Bearer scheme"))
}
