//! Marker publisher: visualization for the passive 3-D viewer.
//!
//! Every update republishes the whole [`MarkerSet`] in the robot base frame:
//!
//! | id | Marker | Shown when |
//! |---|---|---|
//! | 0 | current robot target | a robot target was seen |
//! | 1 | robot targets so far (line strip) | always; empty before motion |
//! | 2 | target zone sphere | always |
//! | 3 | reference trajectory (line strip) | always |
//! | 4 | depth camera pose | `use_depth` and the frame chain is known |
//!
//! Updates are triggered by robot-target samples, at most once per
//! `marker_min_interval`, and by a low-rate timer so the viewer refreshes
//! while the operator is idle.  The component is ready once its first
//! marker set is out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teleop_kernel::TrialParameters;
use teleop_middleware::{QueuePolicy, topics};
use teleop_perception::{FrameTree, ReferenceTrajectory};
use teleop_types::{
    FrameTransform, Marker, MarkerKind, MarkerSet, Message, PoseSample, Quaternion, Transform3D,
    TrialError, Vec3,
};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::component::{Component, ComponentContext, ControlSignal};
use crate::settings::{BASE_FRAME, DEPTH_CAMERA_FRAME, TrialSettings};

pub const MARKER_PUBLISHER_ID: &str = "marker_publisher";

const REFERENCE_PATH_POINTS: usize = 200;
const POSE_MARKER_SCALE: f64 = 0.02;
const LINE_WIDTH: f64 = 0.005;
const CAMERA_MARKER_SCALE: f64 = 0.1;

/// Everything the marker set is built from.
#[derive(Debug, Clone)]
pub struct MarkerScene {
    trajectory: ReferenceTrajectory,
    reference_path: Vec<Vec3>,
    trail: VecDeque<Vec3>,
    trail_capacity: usize,
    robot_pose: Option<Transform3D>,
    frames: FrameTree,
    use_depth: bool,
}

impl MarkerScene {
    pub fn new(trajectory: ReferenceTrajectory, trail_capacity: usize, use_depth: bool) -> Self {
        let trail_capacity = trail_capacity.max(1);
        Self {
            reference_path: trajectory.path(REFERENCE_PATH_POINTS),
            trajectory,
            trail: VecDeque::with_capacity(trail_capacity),
            trail_capacity,
            robot_pose: None,
            frames: FrameTree::new(),
            use_depth,
        }
    }

    pub fn observe_pose(&mut self, sample: &PoseSample) {
        if self.trail.len() == self.trail_capacity {
            self.trail.pop_front();
        }
        self.trail.push_back(sample.position);
        self.robot_pose = Some(Transform3D::new(sample.position, sample.orientation));
    }

    pub fn observe_frames(&mut self, transforms: &[FrameTransform]) {
        self.frames.ingest(transforms);
    }

    /// Forget the path drawn so far.
    pub fn clear_trail(&mut self) {
        self.trail.clear();
    }

    pub fn trail_len(&self) -> usize {
        self.trail.len()
    }

    pub fn build(&self, stamp: Duration) -> MarkerSet {
        let mut markers = Vec::with_capacity(5);
        if let Some(pose) = self.robot_pose {
            markers.push(Marker {
                id: 0,
                kind: MarkerKind::RobotPose,
                pose,
                points: Vec::new(),
                scale: POSE_MARKER_SCALE,
            });
        }
        markers.push(Marker {
            id: 1,
            kind: MarkerKind::TrajectoryPath,
            pose: Transform3D::identity(),
            points: self.trail.iter().copied().collect(),
            scale: LINE_WIDTH,
        });
        let zone = self.trajectory.target_zone();
        markers.push(Marker {
            id: 2,
            kind: MarkerKind::TargetZone,
            pose: Transform3D::new(zone.center, Quaternion::identity()),
            points: Vec::new(),
            scale: zone.radius * 2.0,
        });
        markers.push(Marker {
            id: 3,
            kind: MarkerKind::ReferencePath,
            pose: Transform3D::identity(),
            points: self.reference_path.clone(),
            scale: LINE_WIDTH,
        });
        if self.use_depth {
            if let Some(camera) = self.frames.lookup(BASE_FRAME, DEPTH_CAMERA_FRAME) {
                markers.push(Marker {
                    id: 4,
                    kind: MarkerKind::DepthCamera,
                    pose: camera,
                    points: Vec::new(),
                    scale: CAMERA_MARKER_SCALE,
                });
            }
        }
        MarkerSet {
            frame_id: BASE_FRAME.to_string(),
            stamp,
            markers,
        }
    }
}

pub struct MarkerPublisher {
    params: Arc<TrialParameters>,
    period: Duration,
    min_interval: Duration,
    trail_capacity: usize,
    queue_depth: usize,
}

impl MarkerPublisher {
    pub fn new(params: Arc<TrialParameters>, settings: &TrialSettings) -> Self {
        Self {
            params,
            period: settings.marker_period(),
            min_interval: settings.marker_min_interval,
            trail_capacity: settings.samples_per_trial(),
            queue_depth: settings.queue_depth,
        }
    }
}

#[async_trait]
impl Component for MarkerPublisher {
    fn id(&self) -> &str {
        MARKER_PUBLISHER_ID
    }

    async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
        let trajectory_id = self.params.trajectory_id();
        let trajectory =
            ReferenceTrajectory::for_id(trajectory_id).ok_or_else(|| TrialError::Component {
                component: MARKER_PUBLISHER_ID.to_string(),
                reason: format!("no reference trajectory for id {trajectory_id}"),
            })?;
        let policy = QueuePolicy::DropOldest {
            depth: self.queue_depth,
        };
        let mut poses = ctx.bus().subscribe(&topics::ROBOT_TARGET, policy)?;
        let mut frames = ctx.bus().subscribe(&topics::TF_STATIC, policy)?;
        let publisher = ctx.bus().advertise(&topics::MARKERS, MARKER_PUBLISHER_ID)?;
        let clock = ctx.bus().clock();

        let mut scene = MarkerScene::new(trajectory, self.trail_capacity, self.params.use_depth());
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_publish: Option<Instant> = None;
        let mut ready = false;

        loop {
            let publish_now = tokio::select! {
                biased;
                signal = ctx.recv_control() => match signal {
                    ControlSignal::Shutdown => return Ok(()),
                    ControlSignal::Start { .. } => {
                        scene.clear_trail();
                        false
                    }
                    _ => false,
                },
                Some(envelope) = frames.recv() => {
                    if let Message::Transform(transforms) = &envelope.message {
                        scene.observe_frames(transforms);
                    }
                    false
                }
                Some(envelope) = poses.recv() => {
                    if let Message::Pose(sample) = &envelope.message {
                        scene.observe_pose(sample);
                    }
                    last_publish.is_none_or(|t| t.elapsed() >= self.min_interval)
                }
                _ = timer.tick() => true,
            };
            if !publish_now {
                continue;
            }

            let set = scene.build(clock.now());
            debug!(markers = set.markers.len(), trail = scene.trail_len(), "publishing markers");
            publisher.publish(Message::Markers(set)).await?;
            last_publish = Some(Instant::now());
            ctx.heartbeat();
            if !ready {
                info!(trajectory_id, "first marker set published");
                ctx.set_ready();
                ready = true;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
