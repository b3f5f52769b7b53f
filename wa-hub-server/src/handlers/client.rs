//! `/instances/{id}/client/action/*`: send-message, create-poll, logout.
//! Each enqueue handler maps `EnqueueOutcome` straight onto its response
//! status code, rather than re-deriving it at the call site each time.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use wa_hub_core::chat_id::normalize_chat_id;
use wa_hub_core::instance::EnqueueOutcome;
use wa_hub_model::{InstanceId, QueueItemType};

use crate::infra::app_state::AppState;
use crate::infra::errors::{AppError, AppResult};

fn parse_instance_id(raw: &str) -> AppResult<InstanceId> {
    InstanceId::parse(raw).map_err(|err| AppError::bad_request(err.to_string()))
}

fn enqueue_response(outcome: EnqueueOutcome) -> (StatusCode, Json<Value>) {
    match outcome {
        EnqueueOutcome::AlreadySent { message_id } => (
            StatusCode::OK,
            Json(json!({ "idempotent": true, "messageId": message_id })),
        ),
        EnqueueOutcome::DuplicateQueued => (
            StatusCode::CONFLICT,
            Json(json!({ "error": { "message": "a send with this idempotency key is already queued" } })),
        ),
        EnqueueOutcome::Queued { queue_depth } => (
            StatusCode::ACCEPTED,
            Json(json!({ "queued": true, "queueDepth": queue_depth })),
        ),
        EnqueueOutcome::QueueFull => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": { "message": "instance queue is full" } })),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub chat_id: String,
    pub message: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let id = parse_instance_id(&id)?;
    if !body.chat_id.chars().any(|c| c.is_ascii_digit()) {
        return Err(AppError::bad_request("chatId must contain at least one digit"));
    }
    let chat_id = normalize_chat_id(&body.chat_id);

    let typing_enabled = state
        .instances
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("instance {id}")))?
        .instance
        .typing_enabled;

    let payload = json!({ "chatId": chat_id, "message": body.message });

    if state.instances.system_mode_is_syncing() {
        return Ok(buffered_response(
            &state,
            id,
            QueueItemType::Message,
            payload,
            body.idempotency_key,
            typing_enabled,
        ));
    }

    let outcome = state
        .instances
        .send(&id, QueueItemType::Message, payload, body.idempotency_key, typing_enabled)
        .await?;

    Ok(enqueue_response(outcome))
}

/// Defer a send/poll action into the outbound buffer while the system is
/// globally SYNCING, rather than racing it against the per-instance queue.
/// `InstanceManager` replays it through the normal `send()` path (full
/// idempotency applies) once the system returns to NORMAL.
fn buffered_response(
    state: &AppState,
    id: InstanceId,
    kind: QueueItemType,
    payload: Value,
    idempotency_key: Option<String>,
    apply_typing: bool,
) -> (StatusCode, Json<Value>) {
    match state.instances.enqueue_outbound(id, kind, payload, idempotency_key, apply_typing) {
        Some(buffered_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "queued": true, "bufferedWhileSyncing": true, "bufferedId": buffered_id })),
        ),
        None => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": { "message": "outbound buffer is full while system is syncing" } })),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollBody {
    pub chat_id: String,
    pub caption: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub multiple_answers: bool,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn create_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreatePollBody>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let id = parse_instance_id(&id)?;
    if !body.chat_id.chars().any(|c| c.is_ascii_digit()) {
        return Err(AppError::bad_request("chatId must contain at least one digit"));
    }
    let chat_id = normalize_chat_id(&body.chat_id);
    if body.options.len() < 2 {
        return Err(AppError::bad_request("a poll needs at least two options"));
    }

    let typing_enabled = state
        .instances
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("instance {id}")))?
        .instance
        .typing_enabled;

    let payload = json!({
        "chatId": chat_id,
        "caption": body.caption,
        "options": body.options,
        "multipleAnswers": body.multiple_answers,
    });

    if state.instances.system_mode_is_syncing() {
        return Ok(buffered_response(
            &state,
            id,
            QueueItemType::Poll,
            payload,
            body.idempotency_key,
            typing_enabled,
        ));
    }

    let outcome = state
        .instances
        .send(&id, QueueItemType::Poll, payload, body.idempotency_key, typing_enabled)
        .await?;

    Ok(enqueue_response(outcome))
}

/// Same effect as `DELETE /instances/{id}`.
pub async fn logout(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let id = parse_instance_id(&id)?;
    state.instances.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
