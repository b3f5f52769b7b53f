//! InstanceManager: lifecycle create, restore, delete, update; persistence
//! of the instance list; wiring the driver-event consumer, watchdogs,
//! readiness poll, and send loop for every live instance.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wa_hub_contracts::driver::{DriverEvent, DriverHandle};
use wa_hub_model::{Instance, InstanceId, InstanceState, SupervisorConfig, TypingTarget, WebhookConfig, WebhookEvent};

use crate::buffers::{InboundBuffer, InboundEvent, OutboundItem, OutboundQueue};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsLog};
use crate::error::{CoreError, CoreResult};
use crate::idempotency::IdempotencyStore;
use crate::instance::reconnection::{ensure_ready, DriverFactory};
use crate::instance::runtime::{InstanceHandle, ReadySource};
use crate::instance::send_loop::run_send_loop;
use crate::instance::state_machine::{InitRaceOutcome, LifecycleEvent, SideEffect};
use crate::persistence::InstanceStore;
use crate::system_mode::{SyncingReason, SystemMode, SystemModeController};
use crate::webhook::WebhookDispatcher;

/// Everything a create() call needs that isn't per-request: the persisted
/// store, the idempotency store, the webhook dispatcher, the driver
/// factory, the system mode controller, and the tunables. All injected, not
/// ambient global state.
pub struct InstanceManager {
    registry: DashMap<InstanceId, Arc<InstanceHandle>>,
    diagnostics: DashMap<InstanceId, Arc<DiagnosticsLog>>,
    init_race_senders: DashMap<InstanceId, oneshot::Sender<InitRaceOutcome>>,
    store: Arc<InstanceStore>,
    idempotency: Arc<IdempotencyStore>,
    webhooks: Arc<WebhookDispatcher>,
    driver_factory: Arc<dyn DriverFactory>,
    system_mode: Arc<SystemModeController>,
    /// `message`/`vote_update` driver events observed while SYNCING; flushed
    /// back out as webhooks once the system returns to NORMAL (see
    /// `spawn_buffer_flush_task`).
    inbound: Arc<InboundBuffer>,
    /// Send/poll actions accepted while SYNCING, replayed through `send()`
    /// on the same NORMAL transition.
    outbound: Arc<OutboundQueue>,
    config: SupervisorConfig,
}

/// Snapshot returned by `get`/`list`, combining the persisted descriptor
/// with a handful of runtime fields the HTTP status endpoint needs.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance: Instance,
    pub state: InstanceState,
    pub queue_depth: usize,
    pub phone_number: Option<String>,
    pub ready_source: Option<ReadySource>,
    pub authenticated_at: Option<chrono::DateTime<Utc>>,
    pub ready_at: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<chrono::DateTime<Utc>>,
    pub last_webhook_status: Option<String>,
    pub qr_payload: Option<String>,
}

fn syncing_reason(
    state: InstanceState,
    anchors: &crate::instance::runtime::WatchdogAnchors,
    config: &SupervisorConfig,
) -> SyncingReason {
    match state {
        InstanceState::StartingBrowser => SyncingReason::AlwaysSyncing,
        InstanceState::Connecting => {
            let stuck = anchors
                .connecting_since
                .map(|since| (Utc::now() - since).num_milliseconds() as u64 > config.syncing_max_ms)
                .unwrap_or(false);
            if stuck {
                SyncingReason::ConnectingStuck
            } else {
                SyncingReason::AlwaysSyncing
            }
        }
        InstanceState::NeedsQr => {
            let within_grace = anchors
                .needs_qr_since
                .map(|since| (Utc::now() - since).num_milliseconds() as u64 <= config.qr_sync_grace_ms)
                .unwrap_or(true);
            if within_grace {
                SyncingReason::NeedsQrWithinGrace
            } else {
                SyncingReason::NotSyncing
            }
        }
        _ => SyncingReason::NotSyncing,
    }
}

impl InstanceManager {
    pub fn new(
        store: Arc<InstanceStore>,
        idempotency: Arc<IdempotencyStore>,
        webhooks: Arc<WebhookDispatcher>,
        driver_factory: Arc<dyn DriverFactory>,
        system_mode: Arc<SystemModeController>,
        inbound: Arc<InboundBuffer>,
        outbound: Arc<OutboundQueue>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            registry: DashMap::new(),
            diagnostics: DashMap::new(),
            init_race_senders: DashMap::new(),
            store,
            idempotency,
            webhooks,
            driver_factory,
            system_mode,
            inbound,
            outbound,
            config,
        });
        manager.clone().spawn_buffer_flush_task();
        manager
    }

    /// Accept a send/poll action while the system is globally SYNCING,
    /// deferring it in `outbound` instead of touching the per-instance
    /// queue. Returns the buffer's stable id, or `None` if the buffer is
    /// full.
    pub fn enqueue_outbound(
        &self,
        id: InstanceId,
        kind: wa_hub_model::QueueItemType,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
        apply_typing: bool,
    ) -> Option<uuid::Uuid> {
        let kind_str = match kind {
            wa_hub_model::QueueItemType::Message => "message",
            wa_hub_model::QueueItemType::Poll => "poll",
        };
        let action = serde_json::json!({
            "kind": kind_str,
            "payload": payload,
            "idempotencyKey": idempotency_key,
            "applyTyping": apply_typing,
        });
        self.outbound.enqueue(id, action)
    }

    pub fn system_mode_is_syncing(&self) -> bool {
        self.system_mode.current() == SystemMode::Syncing
    }

    /// Watch for SYNCING -> NORMAL transitions and flush both buffers:
    /// buffered inbound events go back out as webhooks, buffered outbound
    /// actions replay through `send()`.
    fn spawn_buffer_flush_task(self: Arc<Self>) {
        let mut rx = self.system_mode.subscribe();
        tokio::spawn(async move {
            let mut previous = *rx.borrow();
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let current = *rx.borrow();
                if previous == SystemMode::Syncing && current == SystemMode::Normal {
                    self.flush_inbound().await;
                    self.flush_outbound().await;
                }
                previous = current;
            }
        });
    }

    async fn flush_inbound(&self) {
        let webhooks = self.webhooks.clone();
        let registry = &self.registry;
        self.inbound
            .flush(|batch: Vec<InboundEvent>| {
                let webhooks = webhooks.clone();
                async move {
                    for item in batch {
                        let Some(handle) = registry.get(&item.instance_id).map(|e| e.value().clone()) else {
                            continue;
                        };
                        let instance = handle.instance.lock().await.clone();
                        let event = parse_webhook_event(item.event);
                        webhooks.dispatch(&instance, event, item.data).await;
                    }
                }
            })
            .await;
    }

    async fn flush_outbound(self: &Arc<Self>) {
        let manager = self.clone();
        self.outbound
            .drain(|item: OutboundItem| {
                let manager = manager.clone();
                async move {
                    manager.replay_outbound(item).await;
                }
            })
            .await;
    }

    async fn replay_outbound(self: &Arc<Self>, item: OutboundItem) {
        let kind = match item.action.get("kind").and_then(|v| v.as_str()) {
            Some("poll") => wa_hub_model::QueueItemType::Poll,
            _ => wa_hub_model::QueueItemType::Message,
        };
        let payload = item.action.get("payload").cloned().unwrap_or(serde_json::json!({}));
        let idempotency_key = item
            .action
            .get("idempotencyKey")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let apply_typing = item
            .action
            .get("applyTyping")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if let Err(err) = self.send(&item.instance_id, kind, payload, idempotency_key, apply_typing).await {
            warn!(instance = %item.instance_id, error = %err, "failed to replay buffered outbound action after SYNCING->NORMAL");
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    pub fn handle(&self, id: &InstanceId) -> Option<Arc<InstanceHandle>> {
        self.registry.get(id).map(|e| e.value().clone())
    }

    pub async fn list(&self) -> Vec<InstanceSnapshot> {
        let mut out = Vec::with_capacity(self.registry.len());
        for entry in self.registry.iter() {
            if let Some(snapshot) = self.snapshot(entry.key()).await {
                out.push(snapshot);
            }
        }
        out
    }

    pub async fn get(&self, id: &InstanceId) -> Option<InstanceSnapshot> {
        self.snapshot(id).await
    }

    async fn snapshot(&self, id: &InstanceId) -> Option<InstanceSnapshot> {
        let handle = self.handle(id)?;
        let instance = handle.instance.lock().await.clone();
        let runtime = handle.runtime.lock().await;
        Some(InstanceSnapshot {
            instance,
            state: runtime.state,
            queue_depth: runtime.queue_depth(),
            phone_number: runtime.phone_number.clone(),
            ready_source: runtime.ready_source,
            authenticated_at: runtime.anchors.authenticated_at,
            ready_at: runtime.anchors.ready_at,
            last_error: runtime.last_error.clone(),
            last_error_at: runtime.last_error_at,
            last_webhook_status: runtime.last_webhook_status.clone(),
            qr_payload: runtime.qr_payload.clone(),
        })
    }

    pub fn diagnostics(&self, id: &InstanceId) -> Vec<DiagnosticEvent> {
        self.diagnostics
            .get(id)
            .map(|log| log.snapshot())
            .unwrap_or_default()
    }

    /// Create an instance. Validates, persists immediately, attaches
    /// listeners before `initialize`, and races `ready` vs `qr` vs the
    /// configured init timeout.
    pub async fn create(
        self: &Arc<Self>,
        id: InstanceId,
        name: String,
        webhook: WebhookConfig,
        typing_enabled: bool,
        typing_apply_to: BTreeSet<TypingTarget>,
    ) -> CoreResult<InitRaceOutcome> {
        if self.registry.contains_key(&id) {
            return Err(CoreError::UserRequest(format!(
                "instance {id} already exists"
            )));
        }

        let instance = Instance {
            id: id.clone(),
            name,
            created_at: Utc::now(),
            webhook,
            typing_enabled,
            typing_apply_to,
        };

        self.store.upsert(instance.clone()).await;

        let handle = InstanceHandle::new(
            instance,
            self.config.max_sends_per_minute,
            self.config.max_sends_per_hour,
        );
        self.registry.insert(id.clone(), handle.clone());
        self.diagnostics.insert(id.clone(), Arc::new(DiagnosticsLog::new()));

        self.start_instance(id.clone(), handle.clone()).await;

        let (tx, rx) = oneshot::channel();
        self.init_race_senders.insert(id.clone(), tx);

        let driver = {
            let runtime = handle.runtime.lock().await;
            runtime.driver.clone()
        };
        if let Some(driver) = driver {
            if let Err(err) = driver.initialize().await {
                self.init_race_senders.remove(&id);
                return Err(CoreError::PersistentDriver(err.message()));
            }
        }

        // Listeners are attached and initialize() has returned: STARTING_BROWSER -> CONNECTING.
        let effects = {
            let mut runtime = handle.runtime.lock().await;
            runtime.transition_to_connecting_after_init()
        };
        self.process_effects(&id, &handle, effects).await;

        let timeout = Duration::from_millis(self.config.ready_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Ok(InitRaceOutcome::TimedOut),
            Err(_) => {
                self.init_race_senders.remove(&id);
                Ok(InitRaceOutcome::TimedOut)
            }
        }
    }

    /// Wire up a handle's driver and event consumer. Shared by `create` and
    /// `restore`.
    async fn start_instance(self: &Arc<Self>, id: InstanceId, handle: Arc<InstanceHandle>) {
        let driver = match self.driver_factory.build(id.as_str()).await {
            Ok(driver) => driver,
            Err(err) => {
                warn!(instance = %id, error = %err, "failed to build driver handle");
                return;
            }
        };

        {
            let mut runtime = handle.runtime.lock().await;
            runtime.driver = Some(driver.clone());
        }

        self.spawn_driver_event_consumer(id, handle, driver);
    }

    /// Spawn the single consumer task that drains `driver.next_event()` into
    /// the state machine for as long as the instance's cancellation token is
    /// live. Every driver handle an instance ever runs against — the initial
    /// one from `start_instance`, and any replacement the reconnection
    /// ladder's hard restart swaps in — needs exactly one of these, or its
    /// `qr`/`authenticated`/`ready` events are never drained.
    fn spawn_driver_event_consumer(
        self: &Arc<Self>,
        id: InstanceId,
        handle: Arc<InstanceHandle>,
        driver: Arc<dyn DriverHandle>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handle.cancellation.cancelled() => break,
                    event = driver.next_event() => {
                        match event {
                            Some(event) => {
                                manager.handle_driver_event(&id, &handle, event).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    /// Build the callback the reconnection ladder invokes whenever a hard
    /// restart swaps in a fresh driver handle, so a new consumer task gets
    /// attached to it before `initialize()` is called (same "listeners
    /// before initialize" ordering `create` uses).
    fn driver_attach_sink(
        self: &Arc<Self>,
        id: InstanceId,
        handle: Arc<InstanceHandle>,
    ) -> crate::instance::reconnection::DriverAttachSink {
        let manager = self.clone();
        Arc::new(move |driver| {
            manager.spawn_driver_event_consumer(id.clone(), handle.clone(), driver);
        })
    }

    async fn handle_driver_event(
        self: &Arc<Self>,
        id: &InstanceId,
        handle: &Arc<InstanceHandle>,
        event: DriverEvent,
    ) {
        self.record_diagnostic(id, "driver_event", format!("{event:?}"));

        let lifecycle = match event {
            DriverEvent::Qr { payload } => Some(LifecycleEvent::Qr { payload }),
            DriverEvent::Authenticated => Some(LifecycleEvent::Authenticated),
            DriverEvent::Ready => Some(LifecycleEvent::Ready),
            DriverEvent::AuthFailure { message } => Some(LifecycleEvent::AuthFailure { message }),
            DriverEvent::Disconnected { reason } => Some(LifecycleEvent::Disconnected { reason }),
            DriverEvent::ChangeState { state } => {
                let effect = {
                    let runtime = handle.runtime.lock().await;
                    runtime.forward_change_state(state)
                };
                self.process_effects(id, handle, vec![effect]).await;
                None
            }
            DriverEvent::Message { data } => {
                self.dispatch_or_buffer(id, WebhookEvent::Message, data).await;
                None
            }
            DriverEvent::VoteUpdate { data } => {
                self.dispatch_or_buffer(id, WebhookEvent::VoteUpdate, data).await;
                None
            }
        };

        let Some(lifecycle) = lifecycle else { return };

        let effects = {
            let mut runtime = handle.runtime.lock().await;
            runtime.apply_event(lifecycle, &self.config)
        };
        self.process_effects(id, handle, effects).await;
    }

    /// `message`/`vote_update` events: while the system is SYNCING, these
    /// are buffered in `inbound` instead of dispatched immediately, and
    /// flushed once `spawn_buffer_flush_task` observes the return to NORMAL.
    async fn dispatch_or_buffer(&self, id: &InstanceId, event: WebhookEvent, data: serde_json::Value) {
        if self.system_mode_is_syncing() {
            self.inbound.push(InboundEvent {
                instance_id: id.clone(),
                event: event.as_str(),
                data,
            });
            return;
        }
        self.dispatch_raw(id, event, data).await;
    }

    async fn dispatch_raw(&self, id: &InstanceId, event: WebhookEvent, data: serde_json::Value) {
        if let Some(handle) = self.handle(id) {
            let instance = handle.instance.lock().await.clone();
            let webhooks = self.webhooks.clone();
            tokio::spawn(async move {
                webhooks.dispatch(&instance, event, data).await;
            });
        }
    }

    fn record_diagnostic(&self, id: &InstanceId, kind: &str, detail: String) {
        if let Some(log) = self.diagnostics.get(id) {
            log.record(DiagnosticEvent::new(kind, detail));
        }
    }

    /// Process side effects returned by a state-machine transition. Runs
    /// outside any runtime lock.
    async fn process_effects(
        self: &Arc<Self>,
        id: &InstanceId,
        handle: &Arc<InstanceHandle>,
        effects: Vec<SideEffect>,
    ) {
        for effect in effects {
            match effect {
                SideEffect::DispatchWebhook { event, data } => {
                    self.record_diagnostic(id, "webhook", event.to_string());
                    let instance = handle.instance.lock().await.clone();
                    let webhooks = self.webhooks.clone();
                    let event = parse_webhook_event(event);
                    tokio::spawn(async move {
                        webhooks.dispatch(&instance, event, data).await;
                    });
                }
                SideEffect::ArmReadyWatchdog => self.arm_ready_watchdog(id.clone(), handle.clone()).await,
                SideEffect::DisarmReadyWatchdog => {
                    handle.runtime.lock().await.ready_watchdog_generation += 1;
                }
                SideEffect::ArmConnectingWatchdog => {
                    self.arm_connecting_watchdog(id.clone(), handle.clone()).await
                }
                SideEffect::DisarmConnectingWatchdog => {
                    handle.runtime.lock().await.connecting_watchdog_generation += 1;
                }
                SideEffect::ArmNeedsQrWatchdog => {
                    self.arm_needs_qr_watchdog(id.clone(), handle.clone()).await
                }
                SideEffect::DisarmNeedsQrWatchdog => {
                    handle.runtime.lock().await.needs_qr_watchdog_generation += 1;
                }
                SideEffect::StartReadinessPoll => {
                    self.start_readiness_poll(id.clone(), handle.clone()).await
                }
                SideEffect::StopReadinessPoll => {
                    handle.runtime.lock().await.readiness_poll_generation += 1;
                }
                SideEffect::StartSendLoop => self.spawn_send_loop(handle.clone()),
                SideEffect::StopSendLoop => {}
                SideEffect::RecomputeSystemMode => {
                    let (state, reason) = {
                        let runtime = handle.runtime.lock().await;
                        (runtime.state, syncing_reason(runtime.state, &runtime.anchors, &self.config))
                    };
                    let _ = state;
                    self.system_mode.recompute(id.clone(), reason);
                }
                SideEffect::ScheduleAutoWake { after } => self.schedule_auto_wake(id.clone(), handle.clone(), after),
                SideEffect::ResolveInitRace(outcome) => {
                    if let Some((_, tx)) = self.init_race_senders.remove(id) {
                        let _ = tx.send(outcome);
                    }
                }
                SideEffect::TriggerEnsureReady => self.trigger_ensure_ready(id.clone(), handle.clone()),
            }
        }
    }

    fn spawn_send_loop(self: &Arc<Self>, handle: Arc<InstanceHandle>) {
        let idempotency = self.idempotency.clone();
        let webhooks = self.webhooks.clone();
        let config = self.config.clone();
        let on_effects = self.send_loop_effect_sink(handle.clone());
        tokio::spawn(async move {
            run_send_loop(handle, idempotency, webhooks, config, on_effects).await;
        });
    }

    /// Build the callback `run_send_loop` invokes with the side effects of a
    /// disconnect-like send failure (currently just `TriggerEnsureReady` from
    /// `transition_to_disconnected`), routed through the same
    /// `process_effects` path driver events use.
    fn send_loop_effect_sink(
        self: &Arc<Self>,
        handle: Arc<InstanceHandle>,
    ) -> crate::instance::send_loop::EffectSink {
        let manager = self.clone();
        Arc::new(move |effects| {
            let manager = manager.clone();
            let handle = handle.clone();
            Box::pin(async move {
                let id = handle.instance.lock().await.id.clone();
                manager.process_effects(&id, &handle, effects).await;
            })
        })
    }

    fn trigger_ensure_ready(self: &Arc<Self>, id: InstanceId, handle: Arc<InstanceHandle>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.ensure_ready(&id, &handle).await;
        });
    }

    async fn ensure_ready(self: &Arc<Self>, id: &InstanceId, handle: &Arc<InstanceHandle>) {
        let attach = self.driver_attach_sink(id.clone(), handle.clone());
        match ensure_ready(handle, self.driver_factory.as_ref(), &self.config, &attach).await {
            Ok(effects) => self.process_effects(id, handle, effects).await,
            Err(err) => {
                self.record_diagnostic(id, "ensure_ready_failed", err.to_string());
            }
        }
    }

    fn schedule_auto_wake(self: &Arc<Self>, id: InstanceId, handle: Arc<InstanceHandle>, after: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if handle.cancellation.is_cancelled() {
                return;
            }
            manager.ensure_ready(&id, &handle).await;
        });
    }

    async fn arm_ready_watchdog(self: &Arc<Self>, id: InstanceId, handle: Arc<InstanceHandle>) {
        let generation = {
            let mut runtime = handle.runtime.lock().await;
            runtime.ready_watchdog_generation += 1;
            runtime.ready_watchdog_generation
        };
        let manager = self.clone();
        let timeout = Duration::from_millis(self.config.ready_watchdog_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.cancellation.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let fires = {
                        let runtime = handle.runtime.lock().await;
                        runtime.ready_watchdog_generation == generation && runtime.state != InstanceState::Ready
                    };
                    if fires {
                        warn!(instance = %id, "ready watchdog fired, attempting soft restart");
                        manager.ensure_ready(&id, &handle).await;
                    }
                }
            }
        });
    }

    async fn arm_connecting_watchdog(self: &Arc<Self>, id: InstanceId, handle: Arc<InstanceHandle>) {
        let generation = {
            let mut runtime = handle.runtime.lock().await;
            runtime.connecting_watchdog_generation += 1;
            runtime.connecting_watchdog_generation
        };
        let manager = self.clone();
        let timeout = Duration::from_millis(self.config.connecting_watchdog_ms);
        let max_restarts = self.config.connecting_watchdog_max_restarts;
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.cancellation.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let (fires, restart_count) = {
                        let runtime = handle.runtime.lock().await;
                        (
                            runtime.connecting_watchdog_generation == generation
                                && runtime.state == InstanceState::Connecting,
                            runtime.restart_history.len() as u32,
                        )
                    };
                    if !fires {
                        return;
                    }
                    if restart_count >= max_restarts {
                        warn!(instance = %id, "connecting watchdog exhausted restart budget, moving to ERROR");
                        let effects = {
                            let mut runtime = handle.runtime.lock().await;
                            runtime.transition_to_error()
                        };
                        manager.process_effects(&id, &handle, effects).await;
                    } else {
                        warn!(instance = %id, "connecting watchdog fired with no progress, hard restart");
                        manager.ensure_ready(&id, &handle).await;
                    }
                }
            }
        });
    }

    async fn arm_needs_qr_watchdog(self: &Arc<Self>, id: InstanceId, handle: Arc<InstanceHandle>) {
        let (generation, attempts_exceeded) = {
            let mut runtime = handle.runtime.lock().await;
            runtime.needs_qr_watchdog_generation += 1;
            let exceeded = runtime.needs_qr_attempts > self.config.needs_qr_max_recovery_attempts;
            (runtime.needs_qr_watchdog_generation, exceeded)
        };

        if attempts_exceeded {
            warn!(instance = %id, "NEEDS_QR recovery attempts exhausted, transitioning to FAILED_QR_TIMEOUT");
            let effects = {
                let mut runtime = handle.runtime.lock().await;
                runtime.transition_to_failed_qr_timeout()
            };
            self.process_effects(&id, &handle, effects).await;
            return;
        }

        let manager = self.clone();
        let ttl = Duration::from_millis(self.config.needs_qr_ttl_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.cancellation.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    let fires = {
                        let runtime = handle.runtime.lock().await;
                        runtime.needs_qr_watchdog_generation == generation
                            && runtime.state == InstanceState::NeedsQr
                    };
                    if fires {
                        warn!(instance = %id, "NEEDS_QR TTL expired, transitioning to FAILED_QR_TIMEOUT");
                        let effects = {
                            let mut runtime = handle.runtime.lock().await;
                            runtime.transition_to_failed_qr_timeout()
                        };
                        manager.process_effects(&id, &handle, effects).await;
                    }
                }
            }
        });
    }

    /// Readiness-poll fallback: after `authenticated`, poll
    /// `getClientInfo`/`getState` every `readyPollIntervalMs` until both
    /// succeed and report non-empty, then invoke `markReady` tagged `poll`.
    async fn start_readiness_poll(self: &Arc<Self>, id: InstanceId, handle: Arc<InstanceHandle>) {
        let generation = {
            let mut runtime = handle.runtime.lock().await;
            runtime.readiness_poll_generation += 1;
            runtime.readiness_poll_generation
        };
        let manager = self.clone();
        let interval = Duration::from_millis(self.config.ready_poll_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handle.cancellation.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let (still_armed, driver) = {
                    let runtime = handle.runtime.lock().await;
                    (
                        runtime.readiness_poll_generation == generation
                            && matches!(runtime.state, InstanceState::Connecting | InstanceState::NeedsQr),
                        runtime.driver.clone(),
                    )
                };
                if !still_armed {
                    return;
                }
                let Some(driver) = driver else { return };

                let info = driver.get_client_info().await.ok().flatten();
                let state = driver.get_state().await.ok();
                let ready = info.is_some()
                    && matches!(state, Some(wa_hub_contracts::driver::DriverState::Connected));
                if ready {
                    info!(instance = %id, "readiness poll observed ready");
                    let mut effects = Vec::new();
                    {
                        let mut runtime = handle.runtime.lock().await;
                        if let Some(info) = info {
                            runtime.phone_number = info.phone_number;
                            runtime.display_name = info.display_name;
                        }
                        runtime.mark_ready(ReadySource::Poll, &mut effects);
                    }
                    manager.process_effects(&id, &handle, effects).await;
                    return;
                }
            }
        });
    }

    /// Update name/webhook/typing settings and re-persist.
    pub async fn update(
        &self,
        id: &InstanceId,
        name: Option<String>,
        webhook: Option<WebhookConfig>,
        typing_enabled: Option<bool>,
        typing_apply_to: Option<BTreeSet<TypingTarget>>,
    ) -> CoreResult<Instance> {
        let handle = self
            .handle(id)
            .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))?;

        let updated = {
            let mut instance = handle.instance.lock().await;
            if let Some(name) = name {
                instance.name = name;
            }
            if let Some(webhook) = webhook {
                instance.webhook = webhook;
            }
            if let Some(typing_enabled) = typing_enabled {
                instance.typing_enabled = typing_enabled;
            }
            if let Some(typing_apply_to) = typing_apply_to {
                instance.typing_apply_to = typing_apply_to;
            }
            instance.clone()
        };

        self.store.upsert(updated.clone()).await;
        Ok(updated)
    }

    /// Enqueue a message or poll send, deriving the idempotency key when the
    /// caller didn't supply one, and restarting
    /// the send loop if the instance is READY and it was dormant. This is
    /// the entry point the HTTP layer calls; `instance::send_loop::enqueue`
    /// itself only mutates the queue and idempotency store.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        self: &Arc<Self>,
        id: &InstanceId,
        kind: wa_hub_model::QueueItemType,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
        apply_typing: bool,
    ) -> CoreResult<crate::instance::send_loop::EnqueueOutcome> {
        let handle = self
            .handle(id)
            .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))?;

        let instance_name = handle.instance.lock().await.name.clone();

        let key = idempotency_key.unwrap_or_else(|| {
            let kind_str = match kind {
                wa_hub_model::QueueItemType::Message => "message",
                wa_hub_model::QueueItemType::Poll => "poll",
            };
            crate::chat_id::derive_idempotency_key(
                None,
                kind_str,
                &instance_name,
                &payload.to_string(),
            )
        });

        let outcome = crate::instance::send_loop::enqueue(
            &handle,
            &self.idempotency,
            &self.config,
            &instance_name,
            kind,
            payload,
            key,
            apply_typing,
        )
        .await?;

        if matches!(
            outcome,
            crate::instance::send_loop::EnqueueOutcome::Queued { .. }
        ) {
            let (is_ready, running) = {
                let runtime = handle.runtime.lock().await;
                (runtime.state == InstanceState::Ready, runtime.send_loop_running)
            };
            if is_ready && !running {
                self.spawn_send_loop(handle.clone());
            }
        }

        Ok(outcome)
    }

    /// Delete: stop timers and the send loop (via cancellation), destroy the
    /// driver handle with a bounded timeout, remove the in-memory entry,
    /// delete idempotency records for the instance, and drop it from the
    /// persisted list.
    pub async fn delete(&self, id: &InstanceId) -> CoreResult<()> {
        let Some((_, handle)) = self.registry.remove(id) else {
            return Err(CoreError::NotFound(format!("instance {id}")));
        };
        self.diagnostics.remove(id);
        self.init_race_senders.remove(id);

        handle.cancellation.cancel();

        let driver = {
            let runtime = handle.runtime.lock().await;
            runtime.driver.clone()
        };
        if let Some(driver) = driver {
            let timeout = Duration::from_millis(self.config.driver_destroy_timeout_ms);
            if tokio::time::timeout(timeout, driver.destroy()).await.is_err() {
                warn!(instance = %id, "driver destroy timed out, abandoning handle");
            }
        }

        let instance_name = handle.instance.lock().await.name.clone();
        self.idempotency.delete_by_instance_name(&instance_name).await;

        self.store.remove(id).await;
        self.system_mode.remove_instance(id);

        info!(instance = %id, "instance deleted");
        Ok(())
    }

    /// Read the persisted instance list and enqueue each into a
    /// `RestoreScheduler`.
    pub async fn restore_on_startup(self: &Arc<Self>, scheduler: &crate::restore::RestoreScheduler) {
        self.idempotency.cleanup_default().await;
        for instance in self.store.list().await {
            scheduler.enqueue(instance);
        }
    }

    /// `create_fn` for the restore scheduler: re-attach a persisted
    /// instance's runtime and kick off its connection race without
    /// re-validating id/webhook (already persisted) or re-upserting the
    /// store entry.
    pub async fn restore_one(self: &Arc<Self>, instance: Instance) -> Result<(), String> {
        let id = instance.id.clone();
        if self.registry.contains_key(&id) {
            return Ok(());
        }

        let handle = InstanceHandle::new(
            instance,
            self.config.max_sends_per_minute,
            self.config.max_sends_per_hour,
        );
        self.registry.insert(id.clone(), handle.clone());
        self.diagnostics.insert(id.clone(), Arc::new(DiagnosticsLog::new()));

        self.start_instance(id.clone(), handle.clone()).await;

        let driver = {
            let runtime = handle.runtime.lock().await;
            runtime.driver.clone()
        };
        match driver {
            Some(driver) => driver.initialize().await.map_err(|e| e.message()),
            None => Err("failed to build driver handle".to_string()),
        }
    }

    pub fn cancellation_for(&self, id: &InstanceId) -> Option<CancellationToken> {
        self.handle(id).map(|h| h.cancellation.clone())
    }
}

fn parse_webhook_event(event: &'static str) -> WebhookEvent {
    match event {
        "qr" => WebhookEvent::Qr,
        "authenticated" => WebhookEvent::Authenticated,
        "ready" => WebhookEvent::Ready,
        "auth_failure" => WebhookEvent::AuthFailure,
        "disconnected" => WebhookEvent::Disconnected,
        "change_state" => WebhookEvent::ChangeState,
        "message" => WebhookEvent::Message,
        "vote_update" => WebhookEvent::VoteUpdate,
        other => {
            warn!(event = other, "unrecognized webhook event name, dropping");
            WebhookEvent::ChangeState
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::webhook::WebhookAuth;

    struct NullFactory;

    #[async_trait::async_trait]
    impl DriverFactory for NullFactory {
        async fn build(&self, _instance_id: &str) -> CoreResult<Arc<dyn DriverHandle>> {
            Err(CoreError::Internal("driver factory not used in this test".into()))
        }
    }

    fn test_instance(id: &str) -> Instance {
        Instance {
            id: InstanceId::parse(id).unwrap(),
            name: id.to_string(),
            created_at: Utc::now(),
            webhook: WebhookConfig::new("http://example.invalid").unwrap(),
            typing_enabled: false,
            typing_apply_to: Default::default(),
        }
    }

    async fn test_manager() -> Arc<InstanceManager> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InstanceStore::open(dir.path().join("instances.json")).await);
        let idempotency = IdempotencyStore::open(dir.path().join("idempotency.json")).await;
        let webhooks = Arc::new(WebhookDispatcher::new(
            "shh",
            Duration::from_secs(1),
            WebhookAuth {
                bearer_token: None,
                bypass_header: None,
            },
        ));
        let system_mode = Arc::new(SystemModeController::new());
        let inbound = Arc::new(InboundBuffer::new(10, 5, Duration::from_millis(1)));
        let outbound = Arc::new(OutboundQueue::new(10, Duration::from_secs(60), Duration::from_millis(1)));
        InstanceManager::new(
            store,
            idempotency,
            webhooks,
            Arc::new(NullFactory),
            system_mode,
            inbound,
            outbound,
            SupervisorConfig::default(),
        )
    }

    /// A send/poll action accepted while the system is SYNCING must defer
    /// into `outbound` rather than touch the per-instance queue, then land
    /// in that queue once the buffer is flushed after returning to NORMAL.
    #[tokio::test]
    async fn outbound_action_replays_into_instance_queue_after_flush() {
        let manager = test_manager().await;
        let id = InstanceId::parse("i1").unwrap();
        let handle = InstanceHandle::new(test_instance("i1"), 6, 60);
        manager.registry.insert(id.clone(), handle.clone());

        manager
            .enqueue_outbound(
                id.clone(),
                wa_hub_model::QueueItemType::Message,
                serde_json::json!({"chatId": "15551234567", "message": "hi"}),
                Some("k1".to_string()),
                false,
            )
            .expect("outbound buffer has room");

        assert_eq!(manager.outbound.len(), 1);
        assert_eq!(handle.runtime.lock().await.queue.len(), 0);

        manager.flush_outbound().await;

        assert!(manager.outbound.is_empty());
        assert_eq!(handle.runtime.lock().await.queue.len(), 1);
        assert!(manager.idempotency.is_queued("k1").await);
    }

    /// `message`/`vote_update` driver events observed while SYNCING must be
    /// buffered rather than dispatched immediately, and flushed back out
    /// once SYNCING ends.
    #[tokio::test]
    async fn inbound_events_are_buffered_while_syncing() {
        let manager = test_manager().await;
        let id = InstanceId::parse("i1").unwrap();
        let handle = InstanceHandle::new(test_instance("i1"), 6, 60);
        manager.registry.insert(id.clone(), handle.clone());
        manager.diagnostics.insert(id.clone(), Arc::new(DiagnosticsLog::new()));

        manager.system_mode.recompute(id.clone(), SyncingReason::AlwaysSyncing);
        assert!(manager.system_mode_is_syncing());

        manager
            .dispatch_or_buffer(&id, WebhookEvent::Message, serde_json::json!({"body": "hi"}))
            .await;
        assert_eq!(manager.inbound.len(), 1);

        manager.system_mode.recompute(id.clone(), SyncingReason::NotSyncing);
        assert!(!manager.system_mode_is_syncing());

        manager.flush_inbound().await;
        assert!(manager.inbound.is_empty());
    }

    /// §4.2's NEEDS_QR watchdog fires on TTL expiry *or* exceeding the
    /// configured max recovery attempts — this exercises the attempts branch
    /// directly rather than waiting out the (much longer) TTL.
    #[tokio::test]
    async fn needs_qr_watchdog_fires_once_recovery_attempts_are_exhausted() {
        let mut config = SupervisorConfig::default();
        config.needs_qr_max_recovery_attempts = 2;
        config.needs_qr_ttl_ms = 3_600_000;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InstanceStore::open(dir.path().join("instances.json")).await);
        let idempotency = IdempotencyStore::open(dir.path().join("idempotency.json")).await;
        let webhooks = Arc::new(WebhookDispatcher::new(
            "shh",
            Duration::from_secs(1),
            WebhookAuth { bearer_token: None, bypass_header: None },
        ));
        let manager = InstanceManager::new(
            store,
            idempotency,
            webhooks,
            Arc::new(NullFactory),
            Arc::new(SystemModeController::new()),
            Arc::new(InboundBuffer::new(10, 5, Duration::from_millis(1))),
            Arc::new(OutboundQueue::new(10, Duration::from_secs(60), Duration::from_millis(1))),
            config,
        );

        let id = InstanceId::parse("i1").unwrap();
        let handle = InstanceHandle::new(test_instance("i1"), 6, 60);
        manager.registry.insert(id.clone(), handle.clone());
        manager.diagnostics.insert(id.clone(), Arc::new(DiagnosticsLog::new()));

        // Three NEEDS_QR entries: the third exceeds the cap of 2, so the
        // watchdog should transition straight to FAILED_QR_TIMEOUT instead of
        // arming another TTL sleep.
        for _ in 0..3 {
            let effects = {
                let mut runtime = handle.runtime.lock().await;
                runtime.apply_event(
                    LifecycleEvent::Disconnected { reason: "logout".into() },
                    &manager.config,
                )
            };
            manager.process_effects(&id, &handle, effects).await;
        }

        assert_eq!(handle.runtime.lock().await.state, InstanceState::FailedQrTimeout);
    }
}
