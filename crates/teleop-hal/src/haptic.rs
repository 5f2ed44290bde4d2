//! Generic `HapticDevice` trait for the 3-DoF operator input device.
//!
//! The input publisher only ever talks to the trait, so the physical driver
//! and the simulated one are interchangeable.

use teleop_types::{Quaternion, TrialError, Vec3};

/// One raw reading from the device, in device units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DevicePose {
    /// End-effector position in centimetres, device frame.
    pub position_cm: Vec3,
    pub orientation: Quaternion,
}

impl DevicePose {
    /// Position converted to metres.
    pub fn position_m(&self) -> Vec3 {
        self.position_cm.scale(0.01)
    }
}

/// A pose-reporting haptic input device.
pub trait HapticDevice: Send {
    /// Stable identifier, e.g. `"falcon"`.
    fn id(&self) -> &str;

    /// Read the current device pose.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::Hardware`] when the read fails (device
    /// unplugged, USB stall, …).  A single failure is not fatal; the caller
    /// decides when repeated failures mean the input is degraded.
    fn read_pose(&mut self) -> Result<DevicePose, TrialError>;
}

/// Opens a [`HapticDevice`] when a trial starts.
pub trait DeviceFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn HapticDevice>, TrialError>;
}
