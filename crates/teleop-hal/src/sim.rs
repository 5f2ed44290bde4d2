//! Simulated haptic device for headless runs and CI.
//!
//! [`SimHapticDevice`] traces a circle in the device's x/y plane, one step
//! per read, so the produced stream is fully deterministic.  Reads can be
//! made to fail over a window of read indices to exercise the runtime's
//! degraded-input handling.
//!
//! # Example
//!
//! ```rust
//! use teleop_hal::{HapticDevice, SimDeviceConfig, SimHapticDevice};
//!
//! let mut dev = SimHapticDevice::new(SimDeviceConfig::default()).with_dropout(2, 1);
//! assert!(dev.read_pose().is_ok());
//! assert!(dev.read_pose().is_ok());
//! assert!(dev.read_pose().is_err());
//! assert!(dev.read_pose().is_ok());
//! ```

use std::f64::consts::TAU;
use std::ops::Range;

use teleop_types::{Quaternion, TrialError, Vec3};
use tracing::debug;

use crate::haptic::{DeviceFactory, DevicePose, HapticDevice};

/// Motion profile of the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct SimDeviceConfig {
    pub id: String,
    /// Circle centre, centimetres.
    pub center_cm: Vec3,
    /// Circle radius, centimetres.
    pub radius_cm: f64,
    /// Reads per full revolution.
    pub reads_per_revolution: u32,
    /// Read indices that fail.
    pub dropout: Option<Range<u64>>,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            id: "sim_falcon".to_string(),
            center_cm: Vec3::zero(),
            radius_cm: 3.0,
            reads_per_revolution: 500,
            dropout: None,
        }
    }
}

/// A deterministic simulated input device.
pub struct SimHapticDevice {
    config: SimDeviceConfig,
    reads: u64,
}

impl SimHapticDevice {
    pub fn new(config: SimDeviceConfig) -> Self {
        Self { config, reads: 0 }
    }

    /// Make `len` reads starting at read index `start` fail.
    pub fn with_dropout(mut self, start: u64, len: u64) -> Self {
        self.config.dropout = Some(start..start + len);
        self
    }

    /// Number of reads attempted so far, failed ones included.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    fn pose_at(&self, index: u64) -> DevicePose {
        let steps = u64::from(self.config.reads_per_revolution.max(1));
        let phase = TAU * (index % steps) as f64 / steps as f64;
        let r = self.config.radius_cm;
        DevicePose {
            position_cm: self
                .config
                .center_cm
                .add(Vec3::new(r * phase.cos(), r * phase.sin(), 0.0)),
            orientation: Quaternion::identity(),
        }
    }
}

impl HapticDevice for SimHapticDevice {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn read_pose(&mut self) -> Result<DevicePose, TrialError> {
        let index = self.reads;
        self.reads += 1;
        if self
            .config
            .dropout
            .as_ref()
            .is_some_and(|window| window.contains(&index))
        {
            debug!(device = %self.config.id, index, "simulated read failure");
            return Err(TrialError::Hardware {
                device: self.config.id.clone(),
                details: format!("simulated dropout at read {index}"),
            });
        }
        Ok(self.pose_at(index))
    }
}

/// Opens a fresh [`SimHapticDevice`] per trial.
#[derive(Debug, Clone, Default)]
pub struct SimDeviceFactory {
    pub config: SimDeviceConfig,
}

impl SimDeviceFactory {
    pub fn new(config: SimDeviceConfig) -> Self {
        Self { config }
    }
}

impl DeviceFactory for SimDeviceFactory {
    fn open(&self) -> Result<Box<dyn HapticDevice>, TrialError> {
        Ok(Box::new(SimHapticDevice::new(self.config.clone())))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
