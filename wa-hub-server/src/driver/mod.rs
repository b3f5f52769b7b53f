//! Concrete `DriverHandle`/`DriverFactory` implementations. `wa-hub-core`
//! depends only on the trait seam in `wa_hub_contracts::driver`; the binary
//! that actually runs has to supply something behind it. No real
//! browser-automation driver lives in this workspace, so the only
//! implementation shipped here is a simulator, gated behind a `demo` cargo
//! feature.

#[cfg(feature = "demo")]
pub mod demo;
