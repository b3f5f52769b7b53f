//! `/instances` and `/instances/{id}`: list/create/update/delete, plus the
//! read-only `client/status`, `client/qr`, and `diagnostics` sub-routes that
//! report on one instance without mutating it.

use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::response::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use wa_hub_core::instance::manager::InstanceSnapshot;
use wa_hub_model::{InstanceId, InstanceState, TypingTarget, WebhookConfig};

use crate::infra::app_state::AppState;
use crate::infra::errors::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct WebhookConfigBody {
    pub url: String,
    #[serde(default)]
    pub events: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceBody {
    pub name: String,
    pub webhook: WebhookConfigBody,
    #[serde(default)]
    pub typing_indicator_enabled: Option<bool>,
    #[serde(default)]
    pub apply_typing_to: Option<BTreeSet<TypingTarget>>,
}

fn parse_instance_id(raw: &str) -> AppResult<InstanceId> {
    InstanceId::parse(raw).map_err(|err| AppError::bad_request(err.to_string()))
}

fn webhook_config(body: WebhookConfigBody) -> AppResult<WebhookConfig> {
    let mut config = WebhookConfig::new(body.url).map_err(|err| AppError::bad_request(err.to_string()))?;
    config.events = body.events;
    Ok(config)
}

fn snapshot_json(snapshot: &InstanceSnapshot) -> Value {
    json!({
        "id": snapshot.instance.id.as_str(),
        "name": snapshot.instance.name,
        "status": snapshot.state.to_string(),
        "phoneNumber": snapshot.phone_number,
    })
}

pub async fn list_instances(State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.instances.list().await;
    let body: Vec<Value> = snapshots.iter().map(snapshot_json).collect();
    Json(json!(body))
}

pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceBody>,
) -> AppResult<(axum::http::StatusCode, Json<Value>)> {
    if body.name.trim().is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    let id = parse_instance_id(&body.name)?;
    let webhook = webhook_config(body.webhook)?;
    let typing_enabled = body
        .typing_indicator_enabled
        .unwrap_or(state.instances.config().typing_enabled_default);
    let typing_apply_to = body.apply_typing_to.unwrap_or_default();

    let outcome = state
        .instances
        .create(id.clone(), body.name, webhook, typing_enabled, typing_apply_to)
        .await?;

    let snapshot = state
        .instances
        .get(&id)
        .await
        .ok_or_else(|| AppError::internal("instance vanished immediately after create"))?;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({
            "instance": snapshot_json(&snapshot),
            "initOutcome": format!("{:?}", outcome),
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstanceBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub webhook: Option<WebhookConfigBody>,
    #[serde(default)]
    pub typing_indicator_enabled: Option<bool>,
    #[serde(default)]
    pub apply_typing_to: Option<BTreeSet<TypingTarget>>,
}

pub async fn update_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateInstanceBody>,
) -> AppResult<Json<Value>> {
    let id = parse_instance_id(&id)?;
    let webhook = body.webhook.map(webhook_config).transpose()?;

    let updated = state
        .instances
        .update(&id, body.name, webhook, body.typing_indicator_enabled, body.apply_typing_to)
        .await?;

    Ok(Json(json!({
        "id": updated.id.as_str(),
        "name": updated.name,
        "webhook": { "url": updated.webhook.url, "events": updated.webhook.events },
        "typingIndicatorEnabled": updated.typing_enabled,
    })))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<axum::http::StatusCode> {
    let id = parse_instance_id(&id)?;
    state.instances.delete(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_instance_id(&id)?;
    let snapshot = state
        .instances
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("instance {id}")))?;

    Ok(Json(json!({
        "instanceStatus": snapshot.state.to_string(),
        "state": snapshot.state.to_string(),
        "queueDepth": snapshot.queue_depth,
        "phoneNumber": snapshot.phone_number,
        "readySource": snapshot.ready_source.map(|s| format!("{s:?}")),
        "authenticatedAt": snapshot.authenticated_at,
        "readyAt": snapshot.ready_at,
        "lastError": snapshot.last_error,
        "lastErrorAt": snapshot.last_error_at,
        "lastWebhookStatus": snapshot.last_webhook_status,
    })))
}

pub async fn get_qr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_instance_id(&id)?;
    let snapshot = state
        .instances
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("instance {id}")))?;

    if snapshot.state != InstanceState::NeedsQr {
        return Err(AppError::not_found(format!(
            "instance {id} is not awaiting a QR scan (state={})",
            snapshot.state
        )));
    }
    let payload = snapshot
        .qr_payload
        .ok_or_else(|| AppError::not_found(format!("instance {id} has no QR payload yet")))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(payload.as_bytes());
    Ok(Json(json!({ "qr": encoded })))
}

pub async fn get_diagnostics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_instance_id(&id)?;
    if state.instances.get(&id).await.is_none() {
        return Err(AppError::not_found(format!("instance {id}")));
    }
    let events = state.instances.diagnostics(&id);
    Ok(Json(json!(events)))
}
