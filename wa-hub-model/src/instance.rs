//! Instance identity, configuration, and lifecycle state.

use std::collections::BTreeSet;
use std::fmt;

#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Stable tenant identifier, sanitized to `[A-Za-z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct InstanceId(String);

impl InstanceId {
    /// Validate and wrap a caller-supplied id.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty()
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ModelError::InvalidInstanceId(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State machine states from the instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum InstanceState {
    StartingBrowser,
    Connecting,
    NeedsQr,
    Ready,
    Disconnected,
    Paused,
    Restricted,
    Error,
    FailedQrTimeout,
}

impl InstanceState {
    /// States in which the instance owns exactly one live driver handle.
    pub fn holds_driver_handle(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Connecting | Self::StartingBrowser | Self::NeedsQr
        )
    }

    /// Terminal-for-sending states: operations requiring connectivity fail fast.
    pub fn is_terminal_for_send(self) -> bool {
        matches!(
            self,
            Self::NeedsQr | Self::Error | Self::Restricted | Self::FailedQrTimeout
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StartingBrowser => "STARTING_BROWSER",
            Self::Connecting => "CONNECTING",
            Self::NeedsQr => "NEEDS_QR",
            Self::Ready => "READY",
            Self::Disconnected => "DISCONNECTED",
            Self::Paused => "PAUSED",
            Self::Restricted => "RESTRICTED",
            Self::Error => "ERROR",
            Self::FailedQrTimeout => "FAILED_QR_TIMEOUT",
        };
        write!(f, "{s}")
    }
}

/// Recipient class that typing-indicator settings apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TypingTarget {
    Customer,
    Merchant,
}

/// Webhook destination and event filter for an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WebhookConfig {
    pub url: String,
    /// Empty set means "all events".
    #[cfg_attr(feature = "serde", serde(default))]
    pub events: BTreeSet<String>,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ModelError::InvalidWebhookConfig(
                "webhookUrl must not be empty".into(),
            ));
        }
        Ok(Self {
            url,
            events: BTreeSet::new(),
        })
    }

    /// Whether `event` should be dispatched, per the empty-set-means-all rule.
    pub fn accepts(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.contains(event)
    }
}

/// The persisted, tenant-facing portion of an instance.
///
/// Runtime-only fields (queue, counters, watchdog anchors, driver handle) live
/// in `wa-hub-core::instance::InstanceRuntime` behind a lock; this struct is
/// what gets written to the instance-list file and returned from `list()`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    #[cfg(feature = "chrono")]
    pub created_at: DateTime<Utc>,
    pub webhook: WebhookConfig,
    pub typing_enabled: bool,
    pub typing_apply_to: BTreeSet<TypingTarget>,
}
