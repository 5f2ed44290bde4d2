//! Input publisher: haptic device → bus.
//!
//! On every tick the device is read once.  A successful read publishes the
//! raw device pose on `falcon_position` and then the mapped robot target on
//! `robot_target_pose`, in that order, both stamped with the same bus time.
//! The robot sample's `cause` is the device sample's `seq`.
//!
//! A failed read publishes nothing for that tick.  After
//! `degraded_threshold` consecutive failures a single `Degraded` event is
//! reported; the next good read reports `Recovered`.  Dropouts never stop
//! the component.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teleop_hal::DeviceFactory;
use teleop_kernel::TrialParameters;
use teleop_middleware::topics;
use teleop_perception::WORKSPACE_ORIGIN;
use teleop_types::{Message, PoseSample, Quaternion, TrialError, Vec3};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::component::{Component, ComponentContext, ControlSignal, EventKind};
use crate::settings::TrialSettings;

pub const INPUT_PUBLISHER_ID: &str = "input_publisher";

/// Tool pointing straight down: 180° about the base X axis.
pub const TOOL_ORIENTATION: Quaternion = Quaternion {
    w: 0.0,
    x: 1.0,
    y: 0.0,
    z: 0.0,
};

/// Robot target for a device position given in metres.
pub fn map_to_robot(device_m: Vec3, mapping_ratio: f64) -> Vec3 {
    WORKSPACE_ORIGIN.add(device_m.scale(mapping_ratio))
}

/// Consecutive-failure bookkeeping for device reads.
#[derive(Debug, Clone)]
pub struct ReadHealth {
    threshold: u32,
    consecutive: u32,
    degraded: bool,
}

impl ReadHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            degraded: false,
        }
    }

    /// Returns `Degraded` exactly once when the threshold is reached.
    pub fn failure(&mut self) -> Option<EventKind> {
        self.consecutive = self.consecutive.saturating_add(1);
        if !self.degraded && self.consecutive >= self.threshold {
            self.degraded = true;
            return Some(EventKind::Degraded {
                consecutive_failures: self.consecutive,
            });
        }
        None
    }

    /// Returns `Recovered` when a degraded input reads again.
    pub fn success(&mut self) -> Option<EventKind> {
        self.consecutive = 0;
        if self.degraded {
            self.degraded = false;
            return Some(EventKind::Recovered);
        }
        None
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

pub struct InputPublisher {
    params: Arc<TrialParameters>,
    device: Arc<dyn DeviceFactory>,
    period: Duration,
    degraded_threshold: u32,
}

impl InputPublisher {
    pub fn new(
        params: Arc<TrialParameters>,
        device: Arc<dyn DeviceFactory>,
        settings: &TrialSettings,
    ) -> Self {
        Self {
            params,
            device,
            period: settings.device_period(),
            degraded_threshold: settings.degraded_threshold,
        }
    }
}

#[async_trait]
impl Component for InputPublisher {
    fn id(&self) -> &str {
        INPUT_PUBLISHER_ID
    }

    async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
        let mut device = self.device.open()?;
        let device_pub = ctx.bus().advertise(&topics::DEVICE_POSE, INPUT_PUBLISHER_ID)?;
        let robot_pub = ctx.bus().advertise(&topics::ROBOT_TARGET, INPUT_PUBLISHER_ID)?;
        let clock = ctx.bus().clock();
        let ratio = self.params.mapping_ratio();

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health = ReadHealth::new(self.degraded_threshold);
        let mut seq: u64 = 0;

        info!(device = device.id(), period = ?self.period, ratio, "input publisher ready");
        ctx.set_ready();

        loop {
            tokio::select! {
                biased;
                signal = ctx.recv_control() => {
                    if signal == ControlSignal::Shutdown {
                        debug!(published = seq, "input publisher shutting down");
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    ctx.heartbeat();
                    match device.read_pose() {
                        Ok(pose) => {
                            if let Some(event) = health.success() {
                                info!(device = device.id(), "input recovered");
                                ctx.report(event);
                            }
                            let now = clock.now();
                            let position = pose.position_m();
                            device_pub
                                .publish(Message::Pose(PoseSample::device(
                                    seq,
                                    now,
                                    position,
                                    pose.orientation,
                                )))
                                .await?;
                            robot_pub
                                .publish(Message::Pose(PoseSample::robot(
                                    seq,
                                    now,
                                    map_to_robot(position, ratio),
                                    TOOL_ORIENTATION,
                                    seq,
                                )))
                                .await?;
                            seq += 1;
                        }
                        Err(e) => {
                            if let Some(event) = health.failure() {
                                warn!(error = %e, "input degraded");
                                ctx.report(event);
                            } else {
                                debug!(error = %e, "device read failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
