//! Per-instance send queue items.

#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Discriminates the two outbound action kinds the supervisor mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum QueueItemType {
    Message,
    Poll,
}

/// A single queued send, tracked from enqueue through terminal resolution.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QueueItem {
    pub id: Uuid,
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: QueueItemType,
    pub payload: Value,
    pub idempotency_key: String,
    #[cfg(feature = "chrono")]
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    /// Monotonic-clock deadline; serialized as milliseconds-from-epoch for
    /// persistence debugging only — the live scheduler always re-derives this
    /// from `tokio::time::Instant` on restore, never trusts the wire value.
    #[cfg(feature = "chrono")]
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub apply_typing: bool,
}

impl QueueItem {
    pub fn new(
        kind: QueueItemType,
        payload: Value,
        idempotency_key: impl Into<String>,
        apply_typing: bool,
    ) -> Self {
        #[cfg(feature = "chrono")]
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            kind,
            payload,
            idempotency_key: idempotency_key.into(),
            #[cfg(feature = "chrono")]
            created_at: now,
            attempt_count: 0,
            #[cfg(feature = "chrono")]
            next_attempt_at: now,
            last_error: None,
            apply_typing,
        }
    }
}
