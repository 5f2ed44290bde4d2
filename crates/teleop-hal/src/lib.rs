//! `teleop-hal` – hardware abstraction for the operator-side input device.
//!
//! # Modules
//!
//! - [`haptic`] – [`HapticDevice`] trait every input driver implements, and
//!   the [`DeviceFactory`] the runtime opens devices through.
//! - [`sim`] – Deterministic simulated device with fault injection for
//!   headless runs and tests.

pub mod haptic;
pub mod sim;

pub use haptic::{DeviceFactory, DevicePose, HapticDevice};
pub use sim::{SimDeviceConfig, SimDeviceFactory, SimHapticDevice};
