//! Timing and policy knobs of a trial run.
//!
//! These are operational settings, not trial parameters: they never end up
//! in the recording key and may differ between lab setups.

use std::f64::consts::PI;
use std::time::Duration;

use teleop_middleware::bus::{DEFAULT_QUEUE_DEPTH, DEFAULT_SEND_TIMEOUT};
use teleop_types::{FrameTransform, Quaternion, Transform3D, Vec3};

/// Robot base frame every marker is expressed in.
pub const BASE_FRAME: &str = "panda_link0";
pub const CAMERA_BASE_FRAME: &str = "camera_base";
pub const DEPTH_CAMERA_FRAME: &str = "depth_camera";

#[derive(Debug, Clone)]
pub struct TrialSettings {
    /// Length of the recording window.
    pub trial_duration: Duration,
    /// The recorder seals on its own this long after the trial should have
    /// ended, in case the Stop never arrives.
    pub max_duration_margin: Duration,
    /// How long every component gets to report `Ready`.
    pub readiness_timeout: Duration,
    /// Orchestrator polling period.
    pub poll_interval: Duration,
    /// How long to wait for the recorder's `Sealed` after Stop.
    pub seal_timeout: Duration,
    /// Per-component grace period on shutdown before it is aborted.
    pub shutdown_grace: Duration,
    /// A running component silent for longer than this is considered hung.
    pub heartbeat_timeout: Duration,

    /// Haptic device polling rate.
    pub device_rate_hz: f64,
    /// Consecutive failed device reads before `Degraded` is reported.
    pub degraded_threshold: u32,
    /// Abort the trial on `Degraded` instead of only logging it.
    pub abort_on_degraded: bool,

    /// Marker refresh rate when no pose arrives.
    pub marker_rate_hz: f64,
    /// Minimum spacing between pose-triggered marker updates.
    pub marker_min_interval: Duration,
    /// Frame broadcaster re-publish period.
    pub frame_heartbeat: Duration,
    /// Static transforms published on `tf_static`.
    pub frame_transforms: Vec<FrameTransform>,

    /// Depth of drop-oldest subscriber queues.
    pub queue_depth: usize,
    /// Bound on a reliable delivery into the recorder's queue.
    pub reliable_send_timeout: Duration,

    /// Attempts to persist a sealed recording.
    pub persist_attempts: u32,
    /// Backoff before the second attempt; doubled for each further one.
    pub persist_backoff: Duration,

    /// Allow a trial whose completed output already exists to run again.
    pub overwrite: bool,
}

impl TrialSettings {
    pub fn device_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.device_rate_hz.max(1e-3))
    }

    pub fn marker_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.marker_rate_hz.max(1e-3))
    }

    pub fn max_recording_duration(&self) -> Duration {
        self.trial_duration + self.max_duration_margin
    }

    /// Device samples expected over one trial.
    pub fn samples_per_trial(&self) -> usize {
        (self.trial_duration.as_secs_f64() * self.device_rate_hz).ceil() as usize
    }

    /// Capacity of the recorder's reliable queues: the whole maximum window
    /// at the device rate, so a healthy recorder never makes a publisher
    /// wait.
    pub fn recorder_capacity(&self) -> usize {
        ((self.max_recording_duration().as_secs_f64() * self.device_rate_hz).ceil() as usize)
            .max(DEFAULT_QUEUE_DEPTH)
    }
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            trial_duration: Duration::from_secs(10),
            max_duration_margin: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            seal_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(3),
            device_rate_hz: 100.0,
            degraded_threshold: 10,
            abort_on_degraded: false,
            marker_rate_hz: 2.0,
            marker_min_interval: Duration::from_millis(50),
            frame_heartbeat: Duration::from_secs(1),
            frame_transforms: default_frame_transforms(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            reliable_send_timeout: DEFAULT_SEND_TIMEOUT,
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
            overwrite: false,
        }
    }
}

/// Lab calibration of the depth camera mounted opposite the robot, looking
/// back at the workspace.
pub fn default_frame_transforms() -> Vec<FrameTransform> {
    let facing_robot = Quaternion::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), PI);
    vec![
        FrameTransform::new(
            BASE_FRAME,
            CAMERA_BASE_FRAME,
            Transform3D::new(Vec3::new(1.2, 0.0, 0.45), facing_robot),
        ),
        FrameTransform::new(
            CAMERA_BASE_FRAME,
            DEPTH_CAMERA_FRAME,
            Transform3D::new(Vec3::new(0.0, 0.0, 0.032), Quaternion::identity()),
        ),
    ]
}
