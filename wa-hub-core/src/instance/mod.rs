//! Instance runtime: state container, state machine, reconnection ladder,
//! and send loop.

pub mod manager;
pub mod reconnection;
pub mod runtime;
pub mod send_loop;
pub mod state_machine;

pub use manager::InstanceManager;
pub use reconnection::{ensure_ready, DriverFactory};
pub use runtime::{InstanceHandle, InstanceRuntime, ReadySource};
pub use send_loop::{enqueue, run_send_loop, EnqueueOutcome};
pub use state_machine::{InitRaceOutcome, LifecycleEvent, SideEffect};
