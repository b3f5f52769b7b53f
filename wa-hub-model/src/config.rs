//! Supervisor-wide tunables, with sane production defaults for each.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Policy for a queue item that has exhausted retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SendFailurePolicy {
    /// Mark the idempotency record FAILED after `n` attempts and drop the item.
    AbandonAfterN(u32),
    /// Keep retrying with backoff indefinitely.
    RetryForever,
}

impl Default for SendFailurePolicy {
    fn default() -> Self {
        Self::AbandonAfterN(5)
    }
}

/// Every tunable the supervisor reads at runtime, defaulted to values safe
/// for a single small-to-medium WhatsApp Web deployment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SupervisorConfig {
    pub max_queue_size: usize,
    pub max_sends_per_minute: u32,
    pub max_sends_per_hour: u32,
    pub ready_timeout_ms: u64,
    pub soft_restart_timeout_ms: u64,
    pub hard_restart_timeout_ms: u64,
    pub restart_backoff_ms: u64,
    pub max_restarts_per_window: u32,
    pub restart_window_minutes: u64,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub typing_enabled_default: bool,
    pub typing_min_ms: u64,
    pub typing_max_ms: u64,
    pub typing_max_total_ms: u64,
    pub ready_poll_interval_ms: u64,
    pub restore_concurrency: usize,
    pub restore_cooldown_ms: u64,
    pub restore_min_free_mem_mb: u64,
    pub restore_max_attempts: u32,
    pub qr_sync_grace_ms: u64,
    pub syncing_max_ms: u64,
    pub ready_watchdog_ms: u64,
    pub connecting_watchdog_ms: u64,
    pub needs_qr_ttl_ms: u64,
    pub needs_qr_max_recovery_attempts: u32,
    pub connecting_watchdog_max_restarts: u32,
    pub webhook_timeout_ms: u64,
    pub driver_destroy_timeout_ms: u64,
    pub send_failure_policy: SendFailurePolicy,
    /// Case-insensitive substrings identifying a "restriction-like" disconnect
    /// reason (account ban, policy block) rather than an ordinary drop.
    pub restriction_reason_patterns: Vec<String>,
    /// Case-insensitive substrings of disconnect reasons that send straight
    /// to NEEDS_QR rather than the PAUSED/auto-reconnect path.
    pub needs_qr_reason_patterns: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 200,
            max_sends_per_minute: 6,
            max_sends_per_hour: 60,
            ready_timeout_ms: 180_000,
            soft_restart_timeout_ms: 180_000,
            hard_restart_timeout_ms: 180_000,
            restart_backoff_ms: 2_000,
            max_restarts_per_window: 4,
            restart_window_minutes: 10,
            retry_base_backoff_ms: 5_000,
            retry_max_backoff_ms: 120_000,
            typing_enabled_default: true,
            typing_min_ms: 600,
            typing_max_ms: 1_800,
            typing_max_total_ms: 2_500,
            ready_poll_interval_ms: 15_000,
            restore_concurrency: 1,
            restore_cooldown_ms: 30_000,
            restore_min_free_mem_mb: 800,
            restore_max_attempts: 5,
            qr_sync_grace_ms: 30_000,
            syncing_max_ms: 3_600_000,
            ready_watchdog_ms: 600_000,
            connecting_watchdog_ms: 180_000,
            needs_qr_ttl_ms: 600_000,
            needs_qr_max_recovery_attempts: 3,
            connecting_watchdog_max_restarts: 5,
            webhook_timeout_ms: 10_000,
            driver_destroy_timeout_ms: 15_000,
            send_failure_policy: SendFailurePolicy::default(),
            restriction_reason_patterns: vec![
                "banned".into(),
                "restricted".into(),
                "blocked".into(),
            ],
            needs_qr_reason_patterns: vec![
                "logout".into(),
                "unpaired".into(),
                "conflict".into(),
                "timeout".into(),
            ],
        }
    }
}
