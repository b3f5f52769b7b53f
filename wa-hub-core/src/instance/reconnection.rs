//! ReconnectionLadder: single-flight soft→hard restart with backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};
use wa_hub_contracts::driver::DriverHandle;
use wa_hub_model::{InstanceState, SupervisorConfig};

use crate::error::{CoreError, CoreResult};
use crate::instance::runtime::InstanceHandle;
use crate::instance::state_machine::SideEffect;

/// Construct a fresh driver handle for an instance. Supplied by whatever
/// owns the concrete `DriverHandle` implementation — the ladder only knows
/// how to destroy and re-initialize one.
#[async_trait::async_trait]
pub trait DriverFactory: Send + Sync {
    async fn build(&self, instance_id: &str) -> CoreResult<Arc<dyn DriverHandle>>;
}

/// Attaches whatever drains a driver handle's event channel into the state
/// machine — the ladder itself only destroys/builds handles, it doesn't
/// know how to consume their events. Invoked whenever a hard restart swaps
/// in a brand-new handle, mirroring the "listeners before initialize"
/// ordering `InstanceManager::create` uses for the first handle.
pub type DriverAttachSink = Arc<dyn Fn(Arc<dyn DriverHandle>) + Send + Sync>;

/// Wait until the instance reaches READY or NEEDS_QR (a QR arriving counts
/// as restart progress per spec §4.3 steps 8-9, "await ready event or QR"),
/// or the runtime is dropped. Races `driver.initialize()` resolving — which
/// only means the browser launched, not that any lifecycle event fired — so
/// this is what the restart timeout must actually bound.
async fn wait_for_ready_or_qr(handle: &Arc<InstanceHandle>) {
    loop {
        let notify = handle.runtime.lock().await.state_notify.clone();
        let notified = notify.notified();
        let reached = {
            let runtime = handle.runtime.lock().await;
            matches!(runtime.state, InstanceState::Ready | InstanceState::NeedsQr)
        };
        if reached {
            return;
        }
        notified.await;
    }
}

/// Run `ensureReady` for one instance: reconnect an already-READY instance
/// is a no-op, otherwise step through soft restart, hard restart, and
/// finally a rate-limited give-up.
pub async fn ensure_ready(
    handle: &Arc<InstanceHandle>,
    factory: &dyn DriverFactory,
    config: &SupervisorConfig,
    attach: &DriverAttachSink,
) -> CoreResult<Vec<SideEffect>> {
    let instance_id = {
        let instance = handle.instance.lock().await;
        instance.id.to_string()
    };

    {
        let runtime = handle.runtime.lock().await;
        match runtime.state {
            InstanceState::Ready => return Ok(Vec::new()),
            InstanceState::NeedsQr
            | InstanceState::Error
            | InstanceState::FailedQrTimeout
            | InstanceState::Restricted => {
                return Err(CoreError::Terminal(format!(
                    "instance {instance_id} cannot be reconnected from {}",
                    runtime.state
                )));
            }
            InstanceState::Paused => {
                return Err(CoreError::TransientDriver(
                    "already cooling down, auto-wake is scheduled".into(),
                ));
            }
            _ => {}
        }
    }

    // Step 4: restart rate limit, checked before acquiring the mutex so a
    // caller that loses the race still observes PAUSED rather than piling
    // onto a ladder run that's about to fail anyway.
    let now = std::time::Instant::now();
    {
        let mut runtime = handle.runtime.lock().await;
        let window = Duration::from_secs(config.restart_window_minutes as u64 * 60);
        if runtime.restart_history.window() != window {
            runtime.restart_history = crate::rolling_window::RollingWindow::new(window);
        }
        let count = runtime.restart_history.count(now);
        if count as u32 >= config.max_restarts_per_window {
            let next_free = runtime
                .restart_history
                .next_free_at(now)
                .unwrap_or(now);
            let effects =
                runtime.pause_with_auto_wake(next_free.saturating_duration_since(now));
            return Ok(effects);
        }
    }

    // Step 5-6: single-flight mutex, record the attempt.
    let _lock = handle.reconnection_lock.lock().await;

    // Re-check state: a concurrent run may have already fixed things while
    // we waited for the mutex.
    {
        let runtime = handle.runtime.lock().await;
        if runtime.state == InstanceState::Ready {
            return Ok(Vec::new());
        }
    }

    {
        let mut runtime = handle.runtime.lock().await;
        runtime.restart_history.push(now);
    }

    info!(instance = %instance_id, "reconnection ladder starting");

    // Step 7: initial backoff.
    tokio::time::sleep(Duration::from_millis(config.restart_backoff_ms)).await;

    // Step 8: soft restart — destroy and re-initialize the same handle. The
    // event consumer spawned for this handle back when it was first attached
    // keeps draining it across destroy/initialize, so no new consumer is
    // needed here.
    let driver = {
        let runtime = handle.runtime.lock().await;
        runtime.driver.clone()
    };

    if let Some(driver) = driver {
        let _ = driver.destroy().await;
        {
            let mut runtime = handle.runtime.lock().await;
            runtime.transition_to_connecting_for_restart();
        }
        let soft_result = timeout(Duration::from_millis(config.soft_restart_timeout_ms), async {
            driver.initialize().await?;
            wait_for_ready_or_qr(handle).await;
            Ok::<(), wa_hub_contracts::driver::DriverError>(())
        })
        .await;

        if matches!(soft_result, Ok(Ok(()))) {
            let runtime = handle.runtime.lock().await;
            if matches!(runtime.state, InstanceState::Ready | InstanceState::NeedsQr) {
                return Ok(Vec::new());
            }
        }
    }
    warn!(instance = %instance_id, "soft restart did not reach ready, escalating to hard restart");

    // Step 9: hard restart — brand-new driver handle. Attach a fresh event
    // consumer to it before `initialize()` so its `qr`/`authenticated`/`ready`
    // events are actually drained, mirroring `create`'s "listeners before
    // initialize" ordering.
    tokio::time::sleep(Duration::from_millis(config.restart_backoff_ms * 2)).await;

    let fresh = factory.build(&instance_id).await;
    match fresh {
        Ok(fresh_driver) => {
            {
                let mut runtime = handle.runtime.lock().await;
                runtime.driver = Some(fresh_driver.clone());
                runtime.transition_to_connecting_for_restart();
            }
            attach(fresh_driver.clone());
            let hard_result = timeout(Duration::from_millis(config.hard_restart_timeout_ms), async {
                fresh_driver.initialize().await?;
                wait_for_ready_or_qr(handle).await;
                Ok::<(), wa_hub_contracts::driver::DriverError>(())
            })
            .await;

            if matches!(hard_result, Ok(Ok(()))) {
                let runtime = handle.runtime.lock().await;
                if matches!(runtime.state, InstanceState::Ready | InstanceState::NeedsQr) {
                    return Ok(Vec::new());
                }
            }
        }
        Err(err) => {
            warn!(instance = %instance_id, error = %err, "failed to build a fresh driver handle");
        }
    }

    // Step 10: both attempts failed.
    let mut runtime = handle.runtime.lock().await;
    let effects = if runtime.qr_received_during_restart {
        runtime.transition_to_needs_qr()
    } else {
        runtime.transition_to_error()
    };
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_hub_contracts::driver::MockDriverHandle;
    use wa_hub_model::{Instance, InstanceId, WebhookConfig};

    struct FixedFactory;

    #[async_trait::async_trait]
    impl DriverFactory for FixedFactory {
        async fn build(&self, _instance_id: &str) -> CoreResult<Arc<dyn DriverHandle>> {
            let mut mock = MockDriverHandle::new();
            mock.expect_initialize().returning(|| Box::pin(async { Ok(()) }));
            mock.expect_destroy().returning(|| Box::pin(async { Ok(()) }));
            Ok(Arc::new(mock))
        }
    }

    fn test_instance() -> Instance {
        Instance {
            id: InstanceId::parse("i1").unwrap(),
            name: "Test".into(),
            created_at: chrono::Utc::now(),
            webhook: WebhookConfig::new("http://example.invalid").unwrap(),
            typing_enabled: false,
            typing_apply_to: Default::default(),
        }
    }

    fn noop_attach() -> DriverAttachSink {
        Arc::new(|_driver| {})
    }

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_already_ready() {
        let handle = InstanceHandle::new(test_instance(), 6, 60);
        {
            let mut runtime = handle.runtime.lock().await;
            runtime.state = InstanceState::Ready;
        }
        let config = SupervisorConfig::default();
        let effects = ensure_ready(&handle, &FixedFactory, &config, &noop_attach())
            .await
            .unwrap();
        assert!(effects.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_from_needs_qr() {
        let handle = InstanceHandle::new(test_instance(), 6, 60);
        {
            let mut runtime = handle.runtime.lock().await;
            runtime.state = InstanceState::NeedsQr;
        }
        let config = SupervisorConfig::default();
        let result = ensure_ready(&handle, &FixedFactory, &config, &noop_attach()).await;
        assert!(matches!(result, Err(CoreError::Terminal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_restart_attaches_a_consumer_to_the_fresh_driver() {
        let handle = InstanceHandle::new(test_instance(), 6, 60);
        {
            let mut runtime = handle.runtime.lock().await;
            runtime.state = InstanceState::Disconnected;
        }
        let config = SupervisorConfig {
            soft_restart_timeout_ms: 10,
            hard_restart_timeout_ms: 10,
            restart_backoff_ms: 1,
            ..SupervisorConfig::default()
        };

        let attached = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attached_clone = attached.clone();
        let attach: DriverAttachSink = Arc::new(move |_driver| {
            attached_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let result = ensure_ready(&handle, &FixedFactory, &config, &attach).await;
        // No driver was ever attached to the handle (no call to `start_instance`),
        // so the soft-restart branch is skipped entirely and only the hard
        // restart's `factory.build()` runs - which must invoke `attach`.
        assert!(result.is_ok());
        assert_eq!(attached.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
