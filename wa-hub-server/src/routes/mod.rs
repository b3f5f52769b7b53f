//! Route table. `/health` is unauthenticated; every other endpoint sits
//! behind the bearer-token middleware, applied to a nested router so it
//! runs once per request rather than once per route.

use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{client, health, instances};
use crate::infra::app_state::AppState;
use crate::middleware::auth::require_bearer_token;

pub fn build(state: AppState) -> Router {
    let authed = Router::new()
        .route("/instances", get(instances::list_instances).post(instances::create_instance))
        .route(
            "/instances/{id}",
            put(instances::update_instance).delete(instances::delete_instance),
        )
        .route("/instances/{id}/client/qr", get(instances::get_qr))
        .route("/instances/{id}/client/status", get(instances::get_status))
        .route(
            "/instances/{id}/client/action/send-message",
            post(client::send_message),
        )
        .route(
            "/instances/{id}/client/action/create-poll",
            post(client::create_poll),
        )
        .route("/instances/{id}/client/action/logout", post(client::logout))
        .route("/instances/{id}/diagnostics", get(instances::get_diagnostics))
        .route_layer(from_fn_with_state(state.clone(), require_bearer_token));

    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .route("/health", get(health::health))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Permissive by default; restricts `Access-Control-Allow-Origin` to the
/// configured list once the operator sets one.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(origins)
}
