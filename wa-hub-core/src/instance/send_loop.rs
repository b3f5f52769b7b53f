//! SendLoop: per-instance rate-limited drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use wa_hub_model::{IdempotencyRecord, InstanceState, QueueItem, QueueItemType, SendFailurePolicy, SupervisorConfig};

use crate::error::{CoreError, CoreResult};
use crate::idempotency::IdempotencyStore;
use crate::instance::runtime::InstanceHandle;
use crate::instance::state_machine::SideEffect;
use crate::rate_limit::RateLimitDecision;
use crate::webhook::WebhookDispatcher;

/// Hands a transition's side effects back to whatever owns the
/// per-instance watchdog/webhook/ensure-ready machinery (`InstanceManager`),
/// so the send loop itself never needs to know how to arm a watchdog,
/// dispatch a webhook, or kick off reconnection — only how to run the drain.
pub type EffectSink =
    Arc<dyn Fn(Vec<SideEffect>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Outcome of the enqueue path, shaped to map directly onto the handler's
/// HTTP status codes.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// Already sent under this key; no driver call made.
    AlreadySent { message_id: Option<String> },
    /// Rejected as a duplicate of an in-flight (non-stale) queued item.
    DuplicateQueued,
    Queued { queue_depth: usize },
    QueueFull,
}

fn disconnect_like(message: &str) -> bool {
    const MARKERS: &[&str] = &[
        "session closed",
        "disconnected",
        "null",
        "execution context was destroyed",
        "protocol error",
        "failed to launch",
    ];
    let lower = message.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

fn non_retryable_user(message: &str) -> bool {
    message.to_ascii_lowercase().contains("no lid for user")
}

fn exponential_backoff(attempt_count: u32, config: &SupervisorConfig) -> Duration {
    let base = config.retry_base_backoff_ms;
    let capped = base.saturating_mul(1u64 << attempt_count.min(10));
    Duration::from_millis(capped.min(config.retry_max_backoff_ms))
}

/// Enqueue a message or poll.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue(
    handle: &Arc<InstanceHandle>,
    idempotency: &IdempotencyStore,
    config: &SupervisorConfig,
    instance_name: &str,
    kind: QueueItemType,
    payload: Value,
    idempotency_key: String,
    apply_typing: bool,
) -> CoreResult<EnqueueOutcome> {
    if idempotency.is_sent(&idempotency_key).await {
        let record = idempotency.get(&idempotency_key).await;
        return Ok(EnqueueOutcome::AlreadySent {
            message_id: record.and_then(|r| r.provider_message_id),
        });
    }
    if idempotency.is_queued(&idempotency_key).await {
        return Ok(EnqueueOutcome::DuplicateQueued);
    }

    let mut runtime = handle.runtime.lock().await;
    if runtime.state.is_terminal_for_send() {
        return Err(CoreError::Terminal(format!(
            "instance is {} and cannot accept sends",
            runtime.state
        )));
    }
    if runtime.queue.len() >= config.max_queue_size as usize {
        return Ok(EnqueueOutcome::QueueFull);
    }

    let item = QueueItem::new(kind, payload, idempotency_key.clone(), apply_typing);
    runtime.queue.push_back(item.clone());
    let depth = runtime.queue.len();
    let was_dormant = !runtime.send_loop_running;
    drop(runtime);

    idempotency
        .upsert(IdempotencyRecord::new_queued(
            idempotency_key,
            instance_name,
            item.id,
        ))
        .await;

    if was_dormant {
        info!(instance = %instance_name, "send loop was dormant, will be started by caller");
    }

    Ok(EnqueueOutcome::Queued { queue_depth: depth })
}

/// Run the continuous per-instance drain. Intended to be spawned as its own
/// task and to exit as soon as the instance leaves
/// READY or the queue empties; `InstanceManager` re-triggers it on the next
/// enqueue or `READY` transition.
pub async fn run_send_loop(
    handle: Arc<InstanceHandle>,
    idempotency: Arc<IdempotencyStore>,
    webhooks: Arc<WebhookDispatcher>,
    config: SupervisorConfig,
    on_effects: EffectSink,
) {
    {
        let mut runtime = handle.runtime.lock().await;
        if runtime.send_loop_running {
            return;
        }
        runtime.send_loop_running = true;
    }

    loop {
        if handle.cancellation.is_cancelled() {
            break;
        }

        let driver = {
            let runtime = handle.runtime.lock().await;
            if runtime.state != InstanceState::Ready || runtime.queue.is_empty() {
                break;
            }
            runtime.driver.clone()
        };
        let Some(driver) = driver else { break };

        let now = Instant::now();
        let wall_now = Utc::now();
        let selected = {
            let mut runtime = handle.runtime.lock().await;
            let position = runtime
                .queue
                .iter()
                .position(|item| item.next_attempt_at <= wall_now);
            position.map(|idx| runtime.queue[idx].clone())
        };

        let Some(mut item) = selected else {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        };

        if idempotency.is_sent(&item.idempotency_key).await {
            remove_item(&handle, item.id).await;
            continue;
        }

        let decision = {
            let runtime = handle.runtime.lock().await;
            runtime.rate_limiter.check(now)
        };
        if let RateLimitDecision::Deferred {
            retry_at_millis_from_now,
        } = decision
        {
            item.next_attempt_at = wall_now
                + chrono::Duration::milliseconds(retry_at_millis_from_now as i64);
            update_item(&handle, item).await;
            continue;
        }

        let instance_name = {
            let instance = handle.instance.lock().await;
            instance.name.clone()
        };

        let outcome = perform_send(&driver, &item, &config).await;

        match outcome {
            Ok(provider_message_id) => {
                idempotency
                    .mark_sent(&item.idempotency_key, provider_message_id)
                    .await;
                {
                    let mut runtime = handle.runtime.lock().await;
                    runtime.counters.record_send(now);
                    runtime.rate_limiter.record_send(now);
                }
                remove_item(&handle, item.id).await;
            }
            Err(message) if disconnect_like(&message) => {
                item.next_attempt_at = wall_now
                    + chrono::Duration::from_std(exponential_backoff(item.attempt_count, &config))
                        .unwrap_or_default();
                item.attempt_count += 1;
                item.last_error = Some(message);
                update_item(&handle, item).await;

                let side_effects = {
                    let mut runtime = handle.runtime.lock().await;
                    runtime.counters.record_failure(now);
                    runtime.transition_to_disconnected()
                };
                {
                    let mut runtime = handle.runtime.lock().await;
                    runtime.send_loop_running = false;
                }
                warn!(instance = %instance_name, "disconnect-like send failure, instance marked disconnected");
                on_effects(side_effects).await;
                break;
            }
            Err(message) if non_retryable_user(&message) => {
                idempotency.mark_failed(&item.idempotency_key, message).await;
                remove_item(&handle, item.id).await;
            }
            Err(message) => {
                item.attempt_count += 1;
                item.next_attempt_at = wall_now
                    + chrono::Duration::from_std(exponential_backoff(item.attempt_count, &config))
                        .unwrap_or_default();
                item.last_error = Some(message.clone());

                let abandon = matches!(
                    config.send_failure_policy,
                    SendFailurePolicy::AbandonAfterN(n) if item.attempt_count >= n
                );
                if abandon {
                    idempotency.mark_failed(&item.idempotency_key, message).await;
                }
                update_item(&handle, item).await;
                let mut runtime = handle.runtime.lock().await;
                runtime.counters.record_failure(now);
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let mut runtime = handle.runtime.lock().await;
    runtime.send_loop_running = false;
}

async fn perform_send(
    driver: &Arc<dyn wa_hub_contracts::driver::DriverHandle>,
    item: &QueueItem,
    config: &SupervisorConfig,
) -> Result<String, String> {
    let chat_id = item
        .payload
        .get("chatId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let is_group = chat_id.ends_with("@g.us");

    if item.apply_typing && !is_group {
        let _ = driver.send_typing(&chat_id, true).await;
        let jitter_ms = rand::thread_rng().gen_range(600..=1800u64);
        let capped = jitter_ms.min(config.typing_max_total_ms);
        tokio::time::sleep(Duration::from_millis(capped)).await;
        // Guaranteed-cleanup scope: clear typing regardless of what follows.
        let _ = driver.send_typing(&chat_id, false).await;
    }

    let result = match item.kind {
        QueueItemType::Message => {
            let message = item.payload.get("message").and_then(Value::as_str).unwrap_or_default();
            driver.send_message(&chat_id, message).await
        }
        QueueItemType::Poll => {
            let caption = item.payload.get("caption").and_then(Value::as_str).unwrap_or_default();
            let options: Vec<String> = item
                .payload
                .get("options")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let multiple = item
                .payload
                .get("multipleAnswers")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            driver.send_poll(&chat_id, caption, &options, multiple).await
        }
    };

    result.map_err(|e| e.message())
}

async fn remove_item(handle: &Arc<InstanceHandle>, id: Uuid) {
    let mut runtime = handle.runtime.lock().await;
    runtime.queue.retain(|i| i.id != id);
}

async fn update_item(handle: &Arc<InstanceHandle>, updated: QueueItem) {
    let mut runtime = handle.runtime.lock().await;
    if let Some(slot) = runtime.queue.iter_mut().find(|i| i.id == updated.id) {
        *slot = updated;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wa_hub_contracts::driver::{DriverError, MockDriverHandle};
    use wa_hub_model::{Instance, InstanceId, WebhookConfig};

    use crate::webhook::WebhookAuth;

    use super::*;

    #[test]
    fn classifies_disconnect_like_messages() {
        assert!(disconnect_like("Session closed"));
        assert!(disconnect_like("Protocol error (Target.sendMessage)"));
        assert!(!disconnect_like("No LID for user"));
    }

    #[test]
    fn classifies_non_retryable_user_messages() {
        assert!(non_retryable_user("No LID for user +1555"));
        assert!(!non_retryable_user("Session closed"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = SupervisorConfig::default();
        let small = exponential_backoff(0, &config);
        let large = exponential_backoff(20, &config);
        assert!(small < large);
        assert_eq!(large, Duration::from_millis(config.retry_max_backoff_ms));
    }

    fn ready_instance(per_minute_limit: u32) -> Arc<InstanceHandle> {
        let instance = Instance {
            id: InstanceId::parse("i1").unwrap(),
            name: "Test".into(),
            created_at: chrono::Utc::now(),
            webhook: WebhookConfig::new("http://example.invalid").unwrap(),
            typing_enabled: false,
            typing_apply_to: Default::default(),
        };
        InstanceHandle::new(instance, per_minute_limit, 1000)
    }

    /// A successful send must feed the `RateLimiter` itself (not just the
    /// observability `Counters`), or the per-minute limit never trips.
    /// Drives two sends through the real loop against a per-minute limit of
    /// two, then asserts the limiter itself (not the counters) sees both.
    #[tokio::test(start_paused = true)]
    async fn successful_sends_feed_the_rate_limiter() {
        let handle = ready_instance(2);
        let mut mock = MockDriverHandle::new();
        mock.expect_send_message()
            .returning(|_, _| Box::pin(async { Ok("provider-1".to_string()) }));
        let driver: Arc<dyn wa_hub_contracts::driver::DriverHandle> = Arc::new(mock);

        {
            let mut runtime = handle.runtime.lock().await;
            runtime.state = InstanceState::Ready;
            runtime.driver = Some(driver);
            for _ in 0..2 {
                runtime.queue.push_back(QueueItem::new(
                    QueueItemType::Message,
                    serde_json::json!({"chatId": "15551234567", "message": "hi"}),
                    uuid::Uuid::now_v7().to_string(),
                    false,
                ));
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let idempotency = IdempotencyStore::open(dir.path().join("idempotency.json")).await;
        let webhooks = Arc::new(WebhookDispatcher::new(
            "shh",
            Duration::from_secs(1),
            WebhookAuth {
                bearer_token: None,
                bypass_header: None,
            },
        ));
        let sink: EffectSink = Arc::new(|_| Box::pin(async {}));

        run_send_loop(handle.clone(), idempotency, webhooks, SupervisorConfig::default(), sink).await;

        assert!(handle.runtime.lock().await.queue.is_empty());
        assert!(matches!(
            handle.runtime.lock().await.rate_limiter.check(Instant::now()),
            RateLimitDecision::Deferred { .. }
        ));
    }

    /// A disconnect-like send failure must transition the instance to
    /// DISCONNECTED *and* asynchronously invoke `ensureReady` via the effect
    /// sink, not just stop the loop.
    #[tokio::test(start_paused = true)]
    async fn disconnect_like_failure_triggers_ensure_ready_via_sink() {
        let handle = ready_instance(1000);
        let mut mock = MockDriverHandle::new();
        mock.expect_send_message()
            .returning(|_, _| Box::pin(async { Err(DriverError::Failed("Session closed".into())) }));
        let driver: Arc<dyn wa_hub_contracts::driver::DriverHandle> = Arc::new(mock);

        {
            let mut runtime = handle.runtime.lock().await;
            runtime.state = InstanceState::Ready;
            runtime.driver = Some(driver);
            runtime.queue.push_back(QueueItem::new(
                QueueItemType::Message,
                serde_json::json!({"chatId": "15551234567", "message": "hi"}),
                "k1".to_string(),
                false,
            ));
        }

        let dir = tempfile::tempdir().unwrap();
        let idempotency = IdempotencyStore::open(dir.path().join("idempotency.json")).await;
        let webhooks = Arc::new(WebhookDispatcher::new(
            "shh",
            Duration::from_secs(1),
            WebhookAuth {
                bearer_token: None,
                bypass_header: None,
            },
        ));

        let triggered = Arc::new(AtomicUsize::new(0));
        let triggered_in_sink = triggered.clone();
        let sink: EffectSink = Arc::new(move |effects| {
            let triggered = triggered_in_sink.clone();
            Box::pin(async move {
                if effects
                    .iter()
                    .any(|e| matches!(e, SideEffect::TriggerEnsureReady))
                {
                    triggered.fetch_add(1, Ordering::SeqCst);
                }
            })
        });

        run_send_loop(handle.clone(), idempotency, webhooks, SupervisorConfig::default(), sink).await;

        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        let runtime = handle.runtime.lock().await;
        assert_eq!(runtime.state, InstanceState::Disconnected);
        assert!(!runtime.send_loop_running);
    }
}
