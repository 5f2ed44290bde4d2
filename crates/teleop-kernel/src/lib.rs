//! `teleop-kernel` – trial rules and health supervision.
//!
//! It does not move data; it decides what a valid trial is and whether the
//! components running it are still alive.
//!
//! # Modules
//!
//! - [`params`] – the Parameter Store: [`resolve`][params::resolve] turns raw
//!   launch arguments into an immutable
//!   [`TrialParameters`][params::TrialParameters] or a
//!   [`ValidationError`][teleop_types::ValidationError], before anything is
//!   launched.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: tracks component
//!   heartbeats and reports components that went silent.

pub mod params;
pub mod watchdog;

pub use params::{AutonomyLevel, RawTrialArgs, TrialKey, TrialParameters, resolve};
pub use watchdog::{ComponentHealth, Watchdog};
