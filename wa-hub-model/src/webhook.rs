//! Webhook event names and the dispatched payload envelope.

use serde_json::Value;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::instance::InstanceId;

/// Event types the dispatcher may POST to a tenant webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WebhookEvent {
    Qr,
    Authenticated,
    Ready,
    AuthFailure,
    Disconnected,
    ChangeState,
    Message,
    VoteUpdate,
}

impl WebhookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::AuthFailure => "auth_failure",
            Self::Disconnected => "disconnected",
            Self::ChangeState => "change_state",
            Self::Message => "message",
            Self::VoteUpdate => "vote_update",
        }
    }
}

/// Envelope POSTed to the tenant's configured webhook URL.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WebhookPayload {
    pub event: &'static str,
    pub instance_id: InstanceId,
    pub data: Value,
}
