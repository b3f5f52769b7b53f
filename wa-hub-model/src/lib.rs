//! Core data model definitions shared across the supervisor crates.
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod idempotency;
pub mod instance;
pub mod queue;
pub mod webhook;

pub use config::SupervisorConfig;
pub use error::{ModelError, Result as ModelResult};
pub use idempotency::{IdempotencyRecord, IdempotencyStatus};
pub use instance::{
    Instance, InstanceId, InstanceState, TypingTarget, WebhookConfig,
};
pub use queue::{QueueItem, QueueItemType};
pub use webhook::{WebhookEvent, WebhookPayload};
