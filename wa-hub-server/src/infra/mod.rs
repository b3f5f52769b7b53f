//! Ambient server-side plumbing: configuration, error mapping, and the
//! shared `AppState` every handler and middleware layer borrows from.

pub mod app_state;
pub mod config;
pub mod errors;
