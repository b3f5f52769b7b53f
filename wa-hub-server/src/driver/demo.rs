//! A simulated `DriverHandle`: no real browser, no real WhatsApp Web
//! session. Walks every instance through `qr` -> `authenticated` -> `ready`
//! on a short randomized timer so the HTTP surface and `wa-hub-core`'s
//! state machine can be exercised end to end without the real driver
//! this system is built around.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use wa_hub_contracts::driver::{ClientInfo, DriverError, DriverEvent, DriverHandle, DriverState};
use wa_hub_core::error::CoreResult;
use wa_hub_core::instance::DriverFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Pairing,
    Connected,
    Destroyed,
}

struct Shared {
    phase: Mutex<Phase>,
    client_info: Mutex<Option<ClientInfo>>,
}

pub struct DemoDriverHandle {
    instance_id: String,
    shared: Arc<Shared>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DriverEvent>>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
}

impl std::fmt::Debug for DemoDriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoDriverHandle")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl DemoDriverHandle {
    fn new(instance_id: String) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            instance_id,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Opening),
                client_info: Mutex::new(None),
            }),
            events_rx: tokio::sync::Mutex::new(events_rx),
            events_tx,
        }
    }

    fn jitter(min_ms: u64, max_ms: u64) -> Duration {
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl DriverHandle for DemoDriverHandle {
    async fn initialize(&self) -> Result<(), DriverError> {
        let shared = self.shared.clone();
        let tx = self.events_tx.clone();
        let instance_id = self.instance_id.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Self::jitter(150, 500)).await;
            *shared.phase.lock() = Phase::Pairing;
            let payload = format!("demo-qr:{instance_id}:{}", Uuid::new_v4());
            if tx.send(DriverEvent::Qr { payload }).is_err() {
                return;
            }

            tokio::time::sleep(Self::jitter(800, 2_000)).await;
            *shared.client_info.lock() = Some(ClientInfo {
                phone_number: Some(format!("1555{:07}", rand::thread_rng().gen_range(0..10_000_000))),
                display_name: Some(format!("Demo User ({instance_id})")),
            });
            if tx.send(DriverEvent::Authenticated).is_err() {
                return;
            }

            tokio::time::sleep(Self::jitter(100, 300)).await;
            *shared.phase.lock() = Phase::Connected;
            let _ = tx.send(DriverEvent::Ready);
        });

        Ok(())
    }

    async fn destroy(&self) -> Result<(), DriverError> {
        *self.shared.phase.lock() = Phase::Destroyed;
        debug!(instance = %self.instance_id, "demo driver destroyed");
        Ok(())
    }

    async fn send_message(&self, _chat_id: &str, _message: &str) -> Result<String, DriverError> {
        if *self.shared.phase.lock() != Phase::Connected {
            return Err(DriverError::Failed("not connected".to_string()));
        }
        Ok(format!("demo-msg-{}", Uuid::new_v4()))
    }

    async fn send_poll(
        &self,
        _chat_id: &str,
        _caption: &str,
        _options: &[String],
        _multiple_answers: bool,
    ) -> Result<String, DriverError> {
        if *self.shared.phase.lock() != Phase::Connected {
            return Err(DriverError::Failed("not connected".to_string()));
        }
        Ok(format!("demo-poll-{}", Uuid::new_v4()))
    }

    async fn send_typing(&self, _chat_id: &str, _on: bool) -> Result<(), DriverError> {
        if *self.shared.phase.lock() != Phase::Connected {
            return Err(DriverError::Failed("not connected".to_string()));
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<DriverState, DriverError> {
        Ok(match *self.shared.phase.lock() {
            Phase::Opening => DriverState::Opening,
            Phase::Pairing => DriverState::Pairing,
            Phase::Connected => DriverState::Connected,
            Phase::Destroyed => DriverState::Disconnected,
        })
    }

    async fn get_client_info(&self) -> Result<Option<ClientInfo>, DriverError> {
        Ok(self.shared.client_info.lock().clone())
    }

    async fn next_event(&self) -> Option<DriverEvent> {
        self.events_rx.lock().await.recv().await
    }
}

/// Builds one `DemoDriverHandle` per instance. Registered as the
/// `InstanceManager`'s driver factory when the `demo` feature is enabled
/// and no real driver is configured.
#[derive(Debug)]
pub struct DemoDriverFactory;

#[async_trait]
impl DriverFactory for DemoDriverFactory {
    async fn build(&self, instance_id: &str) -> CoreResult<Arc<dyn DriverHandle>> {
        Ok(Arc::new(DemoDriverHandle::new(instance_id.to_string())) as Arc<dyn DriverHandle>)
    }
}
