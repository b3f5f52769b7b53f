//! Global NORMAL/SYNCING mode, one controller per process.
//!
//! Broadcast via `tokio::sync::watch` so background tasks can borrow the
//! current mode without contending on a mutex. Constructed once at process
//! start and injected into every component that needs to read it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use wa_hub_model::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    Normal,
    Syncing,
}

/// What recompute() needs to know about one instance to decide whether it
/// keeps the system in SYNCING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncingReason {
    /// STARTING_BROWSER or CONNECTING: always counts, with no cap. Only
    /// CONNECTING has a "stuck" exception below; STARTING_BROWSER has no
    /// analogous cap.
    AlwaysSyncing,
    /// CONNECTING, but past `syncing_max_ms`: no longer counts.
    ConnectingStuck,
    /// NEEDS_QR within the grace window.
    NeedsQrWithinGrace,
    /// NEEDS_QR past the grace window, or any other state: doesn't count.
    NotSyncing,
}

struct Inner {
    tx: watch::Sender<SystemMode>,
    reasons: Mutex<HashSet<InstanceId>>,
    forced_normal_until: Mutex<Option<Instant>>,
}

/// Evaluates and broadcasts the global system mode. The caller is
/// responsible for flushing the outbound/inbound buffers when `recompute`
/// or `remove_instance` reports a SYNCING -> NORMAL transition.
pub struct SystemModeController {
    inner: Arc<Inner>,
}

impl SystemModeController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SystemMode::Normal);
        Self {
            inner: Arc::new(Inner {
                tx,
                reasons: Mutex::new(HashSet::new()),
                forced_normal_until: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemMode> {
        self.inner.tx.subscribe()
    }

    pub fn current(&self) -> SystemMode {
        *self.inner.tx.borrow()
    }

    /// Re-evaluate whether `instance_id` keeps the system in SYNCING, given
    /// the reason its current state implies. Called after every state
    /// transition.
    pub fn recompute(&self, instance_id: InstanceId, reason: SyncingReason) -> bool {
        {
            let mut reasons = self.inner.reasons.lock();
            match reason {
                SyncingReason::AlwaysSyncing | SyncingReason::NeedsQrWithinGrace => {
                    reasons.insert(instance_id);
                }
                SyncingReason::ConnectingStuck | SyncingReason::NotSyncing => {
                    reasons.remove(&instance_id);
                }
            }
        }
        self.recompute_global()
    }

    pub fn remove_instance(&self, instance_id: &InstanceId) -> bool {
        self.inner.reasons.lock().remove(instance_id);
        self.recompute_global()
    }

    fn recompute_global(&self) -> bool {
        let any_syncing = !self.inner.reasons.lock().is_empty();
        let forced = {
            let mut forced_until = self.inner.forced_normal_until.lock();
            match *forced_until {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    *forced_until = None;
                    false
                }
                None => false,
            }
        };

        let next = if any_syncing && !forced {
            SystemMode::Syncing
        } else {
            SystemMode::Normal
        };

        let previous = *self.inner.tx.borrow();
        if previous != next {
            let _ = self.inner.tx.send(next);
        }
        next == SystemMode::Syncing
    }

    /// Operator override: force NORMAL for `cooldown`, suppressing
    /// re-entering SYNCING even if instances still report syncing reasons.
    pub fn force_normal(&self, cooldown: Duration) {
        *self.inner.forced_normal_until.lock() = Some(Instant::now() + cooldown);
        self.recompute_global();
    }
}

impl Default for SystemModeController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InstanceId {
        InstanceId::parse(s).unwrap()
    }

    #[test]
    fn enters_syncing_when_any_instance_is_connecting() {
        let controller = SystemModeController::new();
        assert_eq!(controller.current(), SystemMode::Normal);
        controller.recompute(id("a"), SyncingReason::AlwaysSyncing);
        assert_eq!(controller.current(), SystemMode::Syncing);
        controller.recompute(id("a"), SyncingReason::NotSyncing);
        assert_eq!(controller.current(), SystemMode::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn force_normal_suppresses_syncing_during_cooldown() {
        let controller = SystemModeController::new();
        controller.recompute(id("a"), SyncingReason::AlwaysSyncing);
        assert_eq!(controller.current(), SystemMode::Syncing);

        controller.force_normal(Duration::from_secs(10));
        assert_eq!(controller.current(), SystemMode::Normal);

        // Still within cooldown: re-asserting the syncing reason doesn't flip it.
        controller.recompute(id("a"), SyncingReason::AlwaysSyncing);
        assert_eq!(controller.current(), SystemMode::Normal);

        tokio::time::advance(Duration::from_secs(11)).await;
        controller.recompute(id("a"), SyncingReason::AlwaysSyncing);
        assert_eq!(controller.current(), SystemMode::Syncing);
    }
}
