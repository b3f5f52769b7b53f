//! The browser-automation driver: an external collaborator exposing events
//! `qr`, `authenticated`, `ready`, `auth_failure`, `disconnected`,
//! `change_state`, `message`, `vote_update` and operations `initialize`,
//! `destroy`, `sendMessage`, `sendPoll`, `getState`. This trait is the seam:
//! `wa-hub-core` depends only on it, and tests drive a `MockDriverHandle`.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Events the driver pushes onto its per-instance event channel.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Qr { payload: String },
    Authenticated,
    Ready,
    AuthFailure { message: String },
    Disconnected { reason: String },
    ChangeState { state: String },
    Message { data: Value },
    VoteUpdate { data: Value },
}

/// Coarse connectivity state as reported by `driver.getState()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Connected,
    Disconnected,
    Opening,
    Pairing,
    Unknown(String),
}

/// Session identity reported by `driver.getClientInfo()` once authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientInfo {
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
}

/// Errors surfaced by driver operations. These map to the `TransientDriver` /
/// `PersistentDriver` error kinds at the call site, which is why this type
/// carries only the raw signal (message text) rather than a pre-classified
/// variant — classification is a SendLoop/StateMachine concern, not the
/// driver's.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("{0}")]
    Failed(String),
    #[error("operation timed out")]
    Timeout,
}

impl DriverError {
    pub fn message(&self) -> String {
        match self {
            DriverError::Failed(msg) => msg.clone(),
            DriverError::Timeout => "operation timed out".to_string(),
        }
    }
}

/// One live handle per instance. Implementations wrap a real
/// headless-browser session; `initialize`/`destroy` bracket its lifetime
/// and `send_message`/`send_poll` perform outbound actions.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait DriverHandle: Send + Sync {
    /// Launch the browser and begin authentication. Must be called after
    /// event listeners are attached.
    async fn initialize(&self) -> Result<(), DriverError>;

    /// Tear down the session. Callers bound this with a timeout.
    async fn destroy(&self) -> Result<(), DriverError>;

    async fn send_message(
        &self,
        chat_id: &str,
        message: &str,
    ) -> Result<String, DriverError>;

    async fn send_poll(
        &self,
        chat_id: &str,
        caption: &str,
        options: &[String],
        multiple_answers: bool,
    ) -> Result<String, DriverError>;

    async fn send_typing(&self, chat_id: &str, on: bool) -> Result<(), DriverError>;

    async fn get_state(&self) -> Result<DriverState, DriverError>;

    async fn get_client_info(&self) -> Result<Option<ClientInfo>, DriverError>;

    /// Pop the next event off this handle's event channel, or `None` once
    /// the channel is closed (typically right after `destroy`). The single
    /// consumer task per instance loops on this to feed the state machine;
    /// that's what gives ordering guarantees without a separate
    /// callback-based listener API.
    async fn next_event(&self) -> Option<DriverEvent>;
}
