//! Trait surfaces that describe the out-of-scope browser-automation driver.

pub mod driver;

pub mod prelude {
    pub use super::driver::{DriverError, DriverEvent, DriverHandle, DriverState};
}
