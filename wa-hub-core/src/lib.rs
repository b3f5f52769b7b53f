//! Instance lifecycle and send-pipeline core for the WhatsApp Web session
//! supervisor. `wa-hub-server` wires these components behind axum handlers;
//! nothing in this crate depends on HTTP or on a concrete browser-automation
//! driver, only on `wa_hub_contracts::driver::DriverHandle`.

pub mod buffers;
pub mod chat_id;
pub mod diagnostics;
pub mod error;
pub mod idempotency;
pub mod instance;
pub mod persistence;
pub mod rate_limit;
pub mod restore;
pub mod rolling_window;
pub mod system_mode;
pub mod webhook;

pub use error::{CoreError, CoreResult};
pub use instance::{DriverFactory, InstanceHandle, InstanceManager};
