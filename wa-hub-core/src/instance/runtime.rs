//! Per-instance runtime state.
//!
//! Everything here is the part of an `Instance` that only exists while the
//! process is up — queue, counters, watchdog anchors, the driver handle, the
//! reconnection single-flight lock. The persisted half lives in
//! `wa_hub_model::Instance`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use wa_hub_contracts::driver::DriverHandle;
use wa_hub_model::{Instance, InstanceState, QueueItem};

use crate::rate_limit::RateLimiter;
use crate::rolling_window::RollingWindow;

/// Source that produced a `READY` transition, carried for observability —
/// tags whether it came from the driver's own event or from the
/// readiness-poll fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    Event,
    Poll,
}

/// Watchdog and lifecycle timestamps used to arm/disarm timers and compute
/// diagnostics.
#[derive(Debug, Default, Clone)]
pub struct WatchdogAnchors {
    pub authenticated_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub last_state_change_at: Option<DateTime<Utc>>,
    pub needs_qr_since: Option<DateTime<Utc>>,
    pub connecting_since: Option<DateTime<Utc>>,
}

/// Rolling-window counters tracked per instance.
pub struct Counters {
    pub sends_1m: RollingWindow,
    pub sends_1h: RollingWindow,
    pub sends_24h: RollingWindow,
    pub failures_1h: RollingWindow,
    pub disconnects_1h: RollingWindow,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            sends_1m: RollingWindow::new(Duration::from_secs(60)),
            sends_1h: RollingWindow::new(Duration::from_secs(3600)),
            sends_24h: RollingWindow::new(Duration::from_secs(24 * 3600)),
            failures_1h: RollingWindow::new(Duration::from_secs(3600)),
            disconnects_1h: RollingWindow::new(Duration::from_secs(3600)),
        }
    }

    pub fn record_send(&mut self, now: Instant) {
        self.sends_1m.push(now);
        self.sends_1h.push(now);
        self.sends_24h.push(now);
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures_1h.push(now);
    }

    pub fn record_disconnect(&mut self, now: Instant) {
        self.disconnects_1h.push(now);
    }
}

/// The mutable, lock-guarded half of an instance's runtime.
///
/// All fields live behind a single lock owned by `InstanceHandle` — the
/// state machine, send loop, and HTTP handlers all serialize through it,
/// giving strict ordering of state transitions without a separate
/// per-instance actor task.
pub struct InstanceRuntime {
    pub state: InstanceState,
    pub queue: VecDeque<QueueItem>,
    pub driver: Option<Arc<dyn DriverHandle>>,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub qr_payload: Option<String>,
    pub last_qr_at: Option<DateTime<Utc>>,
    pub ready_source: Option<ReadySource>,
    pub authenticated_to_ready_ms: Option<i64>,

    pub counters: Counters,
    pub rate_limiter: RateLimiter,
    pub anchors: WatchdogAnchors,

    pub restart_history: RollingWindow,
    pub qr_received_during_restart: bool,

    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_webhook_status: Option<String>,

    pub send_loop_running: bool,

    /// Bumped on every arm/disarm of the corresponding watchdog so a
    /// previously-armed timer firing after a disarm (or a newer re-arm) is a
    /// no-op — cheaper than cancelling the `tokio::time::sleep` outright.
    pub ready_watchdog_generation: u64,
    pub connecting_watchdog_generation: u64,
    pub needs_qr_watchdog_generation: u64,
    pub readiness_poll_generation: u64,

    /// Count of times this instance has entered NEEDS_QR since its last
    /// READY, used to cap the "max recovery attempts" half of the NEEDS_QR
    /// watchdog (the TTL half is the sleep in `arm_needs_qr_watchdog`).
    pub needs_qr_attempts: u32,

    /// Notified on every state transition (see `set_state`). The
    /// reconnection ladder waits on this rather than on `driver.initialize()`
    /// completing, since `initialize()` only launches the browser — it
    /// resolves long before any `ready`/`qr` event reaches the state machine.
    pub state_notify: Arc<tokio::sync::Notify>,
}

impl InstanceRuntime {
    pub fn new(per_minute_limit: u32, per_hour_limit: u32) -> Self {
        Self {
            state: InstanceState::StartingBrowser,
            queue: VecDeque::new(),
            driver: None,
            phone_number: None,
            display_name: None,
            qr_payload: None,
            last_qr_at: None,
            ready_source: None,
            authenticated_to_ready_ms: None,
            counters: Counters::new(),
            rate_limiter: RateLimiter::new(per_minute_limit, per_hour_limit),
            anchors: WatchdogAnchors::default(),
            restart_history: RollingWindow::new(Duration::from_secs(0)),
            qr_received_during_restart: false,
            last_error: None,
            last_error_at: None,
            last_webhook_status: None,
            send_loop_running: false,
            ready_watchdog_generation: 0,
            connecting_watchdog_generation: 0,
            needs_qr_watchdog_generation: 0,
            readiness_poll_generation: 0,
            needs_qr_attempts: 0,
            state_notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }
}

/// A single instance's full runtime handle: the persisted `Instance` plus
/// its lock-guarded `InstanceRuntime`, its reconnection single-flight mutex,
/// and its cancellation context.
///
/// The persisted `Instance` is itself behind a lock since `update()` can
/// change it; it's a separate, shorter-lived lock from `runtime` because
/// HTTP reads of name/webhook config shouldn't contend with the state
/// machine or send loop.
pub struct InstanceHandle {
    pub instance: AsyncMutex<Instance>,
    pub runtime: AsyncMutex<InstanceRuntime>,
    pub reconnection_lock: AsyncMutex<()>,
    pub cancellation: CancellationToken,
}

impl InstanceHandle {
    pub fn new(instance: Instance, per_minute_limit: u32, per_hour_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            instance: AsyncMutex::new(instance),
            runtime: AsyncMutex::new(InstanceRuntime::new(per_minute_limit, per_hour_limit)),
            reconnection_lock: AsyncMutex::new(()),
            cancellation: CancellationToken::new(),
        })
    }
}
