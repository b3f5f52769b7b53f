//! Per-instance state machine: transitions, entry side effects, watchdogs.
//!
//! Deliberately a plain runtime enum with `&mut self` transitions rather
//! than the phantom-typed, compile-time-checked state machine pattern —
//! this graph is driven by concurrent driver events and re-entrant timer
//! callbacks, not a linear caller-driven flow, so the state has to live as
//! data the watchdogs and send loop can all observe and schedule around.
//! Side effects are returned rather than performed inline so the caller
//! (which holds the runtime lock) can release it before doing I/O.

use std::time::Duration;

use chrono::Utc;
use wa_hub_model::{InstanceState, SupervisorConfig};

use super::runtime::{InstanceRuntime, ReadySource};

/// What the browser-automation driver reported, already translated from
/// `wa_hub_contracts::driver::DriverEvent` into the subset the state
/// machine reacts to.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Qr { payload: String },
    Authenticated,
    Ready,
    ReadyFromPoll,
    AuthFailure { message: String },
    Disconnected { reason: String },
}

/// Outcome of the init race started by `InstanceManager::create`: whichever
/// of `ready`, `qr`, or the configured init timeout happens first.
#[derive(Debug, Clone)]
pub enum InitRaceOutcome {
    Ready,
    Qr(String),
    TimedOut,
}

/// A deferred action the caller must perform once the runtime lock is
/// released.
#[derive(Debug, Clone)]
pub enum SideEffect {
    DispatchWebhook {
        event: &'static str,
        data: serde_json::Value,
    },
    ArmReadyWatchdog,
    DisarmReadyWatchdog,
    ArmConnectingWatchdog,
    DisarmConnectingWatchdog,
    ArmNeedsQrWatchdog,
    DisarmNeedsQrWatchdog,
    StartReadinessPoll,
    StopReadinessPoll,
    StartSendLoop,
    StopSendLoop,
    RecomputeSystemMode,
    ScheduleAutoWake { after: Duration },
    ResolveInitRace(InitRaceOutcome),
    TriggerEnsureReady,
}

/// Substring match used for both the restriction classifier and the
/// needs-qr disconnect-reason classifier.
fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

fn matches_any_ci<'a>(haystack: &str, needles: impl IntoIterator<Item = &'a String>) -> bool {
    needles.into_iter().any(|n| contains_ci(haystack, n))
}

impl InstanceRuntime {
    fn set_state(&mut self, next: InstanceState, effects: &mut Vec<SideEffect>) {
        let now = Utc::now();
        self.state = next;
        self.anchors.last_state_change_at = Some(now);

        match next {
            InstanceState::Ready => {
                self.needs_qr_attempts = 0;
                effects.push(SideEffect::DisarmReadyWatchdog);
                effects.push(SideEffect::DisarmConnectingWatchdog);
                effects.push(SideEffect::DisarmNeedsQrWatchdog);
                effects.push(SideEffect::StopReadinessPoll);
                effects.push(SideEffect::StartSendLoop);
            }
            InstanceState::Disconnected
            | InstanceState::NeedsQr
            | InstanceState::Error
            | InstanceState::Restricted
            | InstanceState::FailedQrTimeout => {
                effects.push(SideEffect::StopSendLoop);
            }
            _ => {}
        }

        effects.push(SideEffect::RecomputeSystemMode);

        match next {
            InstanceState::NeedsQr => {
                self.anchors.needs_qr_since = Some(now);
                self.needs_qr_attempts += 1;
                effects.push(SideEffect::ArmNeedsQrWatchdog);
            }
            InstanceState::Connecting => {
                self.anchors.connecting_since = Some(now);
            }
            _ => {}
        }

        self.state_notify.notify_waiters();
    }

    /// Apply a driver-reported lifecycle event, returning the side effects
    /// the caller must perform.
    pub fn apply_event(
        &mut self,
        event: LifecycleEvent,
        config: &SupervisorConfig,
    ) -> Vec<SideEffect> {
        let mut effects = Vec::new();

        match event {
            LifecycleEvent::Qr { payload } => {
                if self.state == InstanceState::Ready {
                    return effects;
                }
                self.qr_payload = Some(payload.clone());
                self.last_qr_at = Some(Utc::now());
                self.qr_received_during_restart = true;
                self.set_state(InstanceState::NeedsQr, &mut effects);
                effects.push(SideEffect::DispatchWebhook {
                    event: "qr",
                    data: serde_json::json!({ "qr": payload }),
                });
                effects.push(SideEffect::ResolveInitRace(InitRaceOutcome::Qr(
                    self.qr_payload.clone().unwrap_or_default(),
                )));
            }

            LifecycleEvent::Authenticated => {
                self.anchors.authenticated_at = Some(Utc::now());
                self.set_state(InstanceState::Connecting, &mut effects);
                effects.push(SideEffect::ArmReadyWatchdog);
                effects.push(SideEffect::StartReadinessPoll);
                effects.push(SideEffect::DispatchWebhook {
                    event: "authenticated",
                    data: serde_json::json!({}),
                });
            }

            LifecycleEvent::Ready | LifecycleEvent::ReadyFromPoll => {
                let source = if matches!(event, LifecycleEvent::ReadyFromPoll) {
                    ReadySource::Poll
                } else {
                    ReadySource::Event
                };
                self.mark_ready(source, &mut effects);
            }

            LifecycleEvent::AuthFailure { message } => {
                self.last_error = Some(message.clone());
                self.last_error_at = Some(Utc::now());
                self.set_state(InstanceState::NeedsQr, &mut effects);
                effects.push(SideEffect::DispatchWebhook {
                    event: "auth_failure",
                    data: serde_json::json!({ "message": message }),
                });
            }

            LifecycleEvent::Disconnected { reason } => {
                self.counters.record_disconnect(std::time::Instant::now());
                self.last_error = Some(reason.clone());
                self.last_error_at = Some(Utc::now());

                if matches_any_ci(&reason, &config.restriction_reason_patterns) {
                    self.set_state(InstanceState::Restricted, &mut effects);
                } else if matches_any_ci(&reason, &config.needs_qr_reason_patterns) {
                    self.set_state(InstanceState::NeedsQr, &mut effects);
                } else {
                    self.set_state(InstanceState::Paused, &mut effects);
                    effects.push(SideEffect::ScheduleAutoWake {
                        after: Duration::from_millis(config.restart_backoff_ms),
                    });
                }

                effects.push(SideEffect::DispatchWebhook {
                    event: "disconnected",
                    data: serde_json::json!({ "reason": reason }),
                });
            }
        }

        effects
    }

    /// Idempotent ready transition: a no-op if already READY, otherwise
    /// triggerable either by the driver's own `ready` event or by the
    /// readiness-poll fallback.
    pub fn mark_ready(&mut self, source: ReadySource, effects: &mut Vec<SideEffect>) {
        if self.state == InstanceState::Ready {
            return;
        }
        let now = Utc::now();
        self.ready_source = Some(source);
        self.anchors.ready_at = Some(now);
        if let Some(authed) = self.anchors.authenticated_at {
            self.authenticated_to_ready_ms = Some((now - authed).num_milliseconds());
        }
        self.set_state(InstanceState::Ready, effects);
        effects.push(SideEffect::DispatchWebhook {
            event: "ready",
            data: serde_json::json!({ "readySource": match source {
                ReadySource::Event => "event",
                ReadySource::Poll => "poll",
            }}),
        });
        effects.push(SideEffect::ResolveInitRace(InitRaceOutcome::Ready));
    }

    /// Forward a driver `change_state` notification. This never changes our
    /// own state (it's informational) but still gets webhook-forwarded per
    /// the webhook-forward rule.
    pub fn forward_change_state(&self, state: impl Into<serde_json::Value>) -> SideEffect {
        SideEffect::DispatchWebhook {
            event: "change_state",
            data: serde_json::json!({ "state": state.into() }),
        }
    }

    /// Transition into PAUSED with an auto-wake timer, used by the
    /// reconnection ladder's restart-rate-limit path.
    pub fn pause_with_auto_wake(&mut self, after: Duration) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        self.set_state(InstanceState::Paused, &mut effects);
        effects.push(SideEffect::ScheduleAutoWake { after });
        effects
    }

    /// Transition to DISCONNECTED, used when PAUSED's cooldown elapses or a
    /// send fails in a disconnect-like way. Also kicks off `ensureReady`
    /// asynchronously, since DISCONNECTED never recovers on its own.
    pub fn transition_to_disconnected(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        self.set_state(InstanceState::Disconnected, &mut effects);
        effects.push(SideEffect::TriggerEnsureReady);
        effects
    }

    pub fn transition_to_error(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        self.set_state(InstanceState::Error, &mut effects);
        effects
    }

    pub fn transition_to_needs_qr(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        self.set_state(InstanceState::NeedsQr, &mut effects);
        effects
    }

    pub fn transition_to_failed_qr_timeout(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        self.set_state(InstanceState::FailedQrTimeout, &mut effects);
        effects
    }

    pub fn transition_to_connecting_for_restart(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        self.qr_received_during_restart = false;
        self.set_state(InstanceState::Connecting, &mut effects);
        effects.push(SideEffect::ArmConnectingWatchdog);
        effects
    }

    /// Transition STARTING_BROWSER -> CONNECTING once listeners are attached
    /// and `initialize()` has returned, ahead of any driver event. A no-op if
    /// a driver event already moved the instance on (e.g. a fast `qr`) by the
    /// time `initialize()` resolves.
    pub fn transition_to_connecting_after_init(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        if self.state == InstanceState::StartingBrowser {
            self.set_state(InstanceState::Connecting, &mut effects);
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SupervisorConfig {
        SupervisorConfig::default()
    }

    fn runtime() -> InstanceRuntime {
        InstanceRuntime::new(6, 60)
    }

    #[test]
    fn qr_event_moves_to_needs_qr_and_dispatches_webhook() {
        let mut rt = runtime();
        let effects = rt.apply_event(
            LifecycleEvent::Qr {
                payload: "base64==".into(),
            },
            &config(),
        );
        assert_eq!(rt.state, InstanceState::NeedsQr);
        assert!(effects
            .iter()
            .any(|e| matches!(e, SideEffect::DispatchWebhook { event, .. } if *event == "qr")));
    }

    #[test]
    fn qr_event_is_ignored_while_ready() {
        let mut rt = runtime();
        rt.state = InstanceState::Ready;
        let effects = rt.apply_event(
            LifecycleEvent::Qr {
                payload: "x".into(),
            },
            &config(),
        );
        assert_eq!(rt.state, InstanceState::Ready);
        assert!(effects.is_empty());
    }

    #[test]
    fn mark_ready_is_idempotent() {
        let mut rt = runtime();
        let mut effects = Vec::new();
        rt.mark_ready(ReadySource::Event, &mut effects);
        assert_eq!(rt.state, InstanceState::Ready);

        let mut effects2 = Vec::new();
        rt.mark_ready(ReadySource::Poll, &mut effects2);
        assert!(effects2.is_empty());
        assert_eq!(rt.ready_source, Some(ReadySource::Event));
    }

    #[test]
    fn disconnect_with_restriction_reason_goes_to_restricted() {
        let mut cfg = config();
        cfg.restriction_reason_patterns = vec!["banned".into()];
        let mut rt = runtime();
        let effects = rt.apply_event(
            LifecycleEvent::Disconnected {
                reason: "Account banned for spam".into(),
            },
            &cfg,
        );
        assert_eq!(rt.state, InstanceState::Restricted);
        assert!(!effects
            .iter()
            .any(|e| matches!(e, SideEffect::ScheduleAutoWake { .. })));
    }

    #[test]
    fn disconnect_with_logout_reason_goes_to_needs_qr() {
        let mut rt = runtime();
        rt.apply_event(
            LifecycleEvent::Disconnected {
                reason: "user LOGOUT requested".into(),
            },
            &config(),
        );
        assert_eq!(rt.state, InstanceState::NeedsQr);
    }

    #[test]
    fn disconnect_with_unclassified_reason_pauses_with_auto_wake() {
        let mut rt = runtime();
        let effects = rt.apply_event(
            LifecycleEvent::Disconnected {
                reason: "socket hang up".into(),
            },
            &config(),
        );
        assert_eq!(rt.state, InstanceState::Paused);
        assert!(effects
            .iter()
            .any(|e| matches!(e, SideEffect::ScheduleAutoWake { .. })));
    }

    #[test]
    fn needs_qr_attempts_accumulate_and_reset_on_ready() {
        let mut rt = runtime();
        rt.apply_event(LifecycleEvent::Qr { payload: "a".into() }, &config());
        rt.apply_event(LifecycleEvent::AuthFailure { message: "bad".into() }, &config());
        assert_eq!(rt.needs_qr_attempts, 2);

        let mut effects = Vec::new();
        rt.mark_ready(ReadySource::Event, &mut effects);
        assert_eq!(rt.needs_qr_attempts, 0);
    }

    #[test]
    fn connecting_after_init_only_applies_from_starting_browser() {
        let mut rt = runtime();
        assert_eq!(rt.state, InstanceState::StartingBrowser);
        let effects = rt.transition_to_connecting_after_init();
        assert_eq!(rt.state, InstanceState::Connecting);
        assert!(!effects.is_empty());

        // A later call (e.g. a fast `qr` already moved the instance on) is a no-op.
        rt.state = InstanceState::NeedsQr;
        let effects = rt.transition_to_connecting_after_init();
        assert_eq!(rt.state, InstanceState::NeedsQr);
        assert!(effects.is_empty());
    }
}
