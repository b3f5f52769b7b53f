//! `AppState`: the single `Clone`-able handle every axum extractor and
//! middleware layer borrows from — `Arc`-wrapped services behind a derived
//! `Clone`, with a manual `Debug` via `finish_non_exhaustive` since most of
//! its fields don't implement it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use wa_hub_core::buffers::{InboundBuffer, OutboundQueue};
use wa_hub_core::idempotency::IdempotencyStore;
use wa_hub_core::instance::InstanceManager;
use wa_hub_core::persistence::InstanceStore;
use wa_hub_core::restore::RestoreScheduler;
use wa_hub_core::system_mode::SystemModeController;
use wa_hub_core::webhook::{WebhookAuth, WebhookDispatcher};

use crate::driver::demo::DemoDriverFactory;
use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub instances: Arc<InstanceManager>,
    pub system_mode: Arc<SystemModeController>,
    pub outbound: Arc<OutboundQueue>,
    pub inbound: Arc<InboundBuffer>,
    pub restore: Arc<RestoreScheduler>,
    started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire every long-lived service from `config`: open the persisted
    /// stores, construct the webhook dispatcher and system-mode
    /// controller, and register the demo driver factory. Nothing in this
    /// workspace implements a real browser-automation driver, so the
    /// in-process simulator is what `InstanceManager` drives against until
    /// a real one is wired in.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let store = Arc::new(InstanceStore::open(config.instances_path()).await);
        let idempotency = IdempotencyStore::open(config.idempotency_path()).await;

        let webhook_auth = WebhookAuth {
            bearer_token: config.webhook_bearer_token.clone(),
            bypass_header: match (&config.webhook_bypass_header_name, &config.webhook_bypass_header_value) {
                (Some(name), Some(value)) => Some((name.clone(), value.clone())),
                _ => None,
            },
        };
        let webhooks = Arc::new(WebhookDispatcher::new(
            config.webhook_secret.clone(),
            Duration::from_millis(config.supervisor.webhook_timeout_ms),
            webhook_auth,
        ));

        let system_mode = Arc::new(SystemModeController::new());

        let outbound = Arc::new(OutboundQueue::new(
            config.outbound_queue_capacity,
            Duration::from_millis(config.outbound_queue_ttl_ms),
            Duration::from_millis(config.outbound_queue_inter_item_delay_ms),
        ));
        let inbound = Arc::new(InboundBuffer::new(
            config.inbound_buffer_capacity,
            config.inbound_buffer_batch_size,
            Duration::from_millis(config.inbound_buffer_inter_batch_delay_ms),
        ));

        let instances = InstanceManager::new(
            store,
            idempotency,
            webhooks,
            Arc::new(DemoDriverFactory),
            system_mode.clone(),
            inbound.clone(),
            outbound.clone(),
            config.supervisor.clone(),
        );

        let restore = Arc::new(RestoreScheduler::new(
            config.supervisor.restore_concurrency,
            Duration::from_millis(config.supervisor.restore_cooldown_ms),
            config.supervisor.restore_min_free_mem_mb,
            config.supervisor.restore_max_attempts,
        ));

        Ok(Self {
            config: Arc::new(config),
            instances,
            system_mode,
            outbound,
            inbound,
            restore,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
