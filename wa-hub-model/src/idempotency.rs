//! Persisted idempotency records: at-most-once status tracking for a
//! logical send, keyed by a stable idempotency key.

#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Status of a logical send, as tracked by the idempotency store.
///
/// Ordering encodes the "never regresses from SENT" invariant: once a record
/// reaches `Sent` no other status may be written over it (see
/// `IdempotencyStatus::may_transition_to`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum IdempotencyStatus {
    Queued,
    Sent,
    Failed,
    Skipped,
}

impl IdempotencyStatus {
    /// `Sent` is a sink: no further status change is ever applied over it.
    pub fn may_transition_to(self, next: IdempotencyStatus) -> bool {
        !matches!(self, IdempotencyStatus::Sent) || next == IdempotencyStatus::Sent
    }
}

/// A single idempotency-key record persisted to the idempotency store file.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IdempotencyRecord {
    pub key: String,
    pub instance_name: String,
    pub queue_item_id: uuid::Uuid,
    pub status: IdempotencyStatus,
    #[cfg(feature = "chrono")]
    pub created_at: DateTime<Utc>,
    #[cfg(feature = "chrono")]
    pub updated_at: DateTime<Utc>,
    #[cfg(feature = "chrono")]
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl IdempotencyRecord {
    pub fn new_queued(
        key: impl Into<String>,
        instance_name: impl Into<String>,
        queue_item_id: uuid::Uuid,
    ) -> Self {
        #[cfg(feature = "chrono")]
        let now = Utc::now();
        Self {
            key: key.into(),
            instance_name: instance_name.into(),
            queue_item_id,
            status: IdempotencyStatus::Queued,
            #[cfg(feature = "chrono")]
            created_at: now,
            #[cfg(feature = "chrono")]
            updated_at: now,
            #[cfg(feature = "chrono")]
            sent_at: None,
            provider_message_id: None,
            error: None,
        }
    }
}
