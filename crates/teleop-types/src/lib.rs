//! `teleop-types` – shared wire data for the teleoperation trial runtime.
//!
//! Everything that crosses a component boundary lives here: the messages
//! carried on the bus, the schema tags that make topic identity a typed
//! contract, the orchestrator's lifecycle states and the error taxonomy.

pub mod geometry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use geometry::{Quaternion, Transform3D, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Pose samples
// ────────────────────────────────────────────────────────────────────────────

/// Which side of the teleoperation loop produced a [`PoseSample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseSource {
    /// Raw haptic-device pose (the human's hand).
    Device,
    /// Robot target pose derived from a device sample.
    Robot,
}

/// A time-stamped pose.
///
/// `timestamp` is monotonic bus time while the sample is in flight and
/// trial-relative time once it is stored in a sealed recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    /// Per-source sequence number, strictly increasing for one publisher.
    pub seq: u64,
    pub timestamp: Duration,
    /// Position in metres.
    pub position: Vec3,
    pub orientation: Quaternion,
    pub source: PoseSource,
    /// For robot samples: the `seq` of the device sample this one was
    /// derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<u64>,
}

impl PoseSample {
    pub fn device(seq: u64, timestamp: Duration, position: Vec3, orientation: Quaternion) -> Self {
        Self {
            seq,
            timestamp,
            position,
            orientation,
            source: PoseSource::Device,
            cause: None,
        }
    }

    pub fn robot(
        seq: u64,
        timestamp: Duration,
        position: Vec3,
        orientation: Quaternion,
        cause: u64,
    ) -> Self {
        Self {
            seq,
            timestamp,
            position,
            orientation,
            source: PoseSource::Robot,
            cause: Some(cause),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transforms and markers
// ────────────────────────────────────────────────────────────────────────────

/// A named parent → child coordinate-frame transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTransform {
    pub parent: String,
    pub child: String,
    pub transform: Transform3D,
}

impl FrameTransform {
    pub fn new(
        parent: impl Into<String>,
        child: impl Into<String>,
        transform: Transform3D,
    ) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            transform,
        }
    }
}

/// Kind of a visualization marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Sphere at the current robot target.
    RobotPose,
    /// Line strip through the robot targets seen so far.
    TrajectoryPath,
    /// Sphere the operator should start the trajectory from.
    TargetZone,
    /// Line strip of the reference trajectory for this trial.
    ReferencePath,
    /// Axis triad at the depth camera pose.
    DepthCamera,
}

/// A single visualization primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: u32,
    pub kind: MarkerKind,
    pub pose: Transform3D,
    /// Points for line-strip markers; empty for single-pose markers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<Vec3>,
    /// Sphere diameter / line width in metres.
    pub scale: f64,
}

/// The full set of markers republished on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerSet {
    pub frame_id: String,
    pub stamp: Duration,
    pub markers: Vec<Marker>,
}

impl MarkerSet {
    pub fn marker(&self, kind: MarkerKind) -> Option<&Marker> {
        self.markers.iter().find(|m| m.kind == kind)
    }
}

/// Recording-window triggers broadcast on the `record` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    RecordStart,
    RecordStop,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus messages
// ────────────────────────────────────────────────────────────────────────────

/// Schema tag for a topic.  Topic identity is its name; its schema is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Schema {
    Pose,
    MarkerSet,
    Transform,
    Trigger,
}

/// Every payload that can travel over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", content = "data")]
pub enum Message {
    Pose(PoseSample),
    Markers(MarkerSet),
    Transform(Vec<FrameTransform>),
    Trigger(Trigger),
}

impl Message {
    /// The schema this payload belongs to.
    pub fn schema(&self) -> Schema {
        match self {
            Message::Pose(_) => Schema::Pose,
            Message::Markers(_) => Schema::MarkerSet,
            Message::Transform(_) => Schema::Transform,
            Message::Trigger(_) => Schema::Trigger,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trial lifecycle
// ────────────────────────────────────────────────────────────────────────────

/// States of the trial orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialState {
    Resolving,
    Launching,
    AwaitingReady,
    Running,
    Stopping,
    Complete,
    Aborted,
}

impl TrialState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrialState::Complete | TrialState::Aborted)
    }
}

/// One entry of an abort reason trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortEntry {
    /// The component involved, if the failure is attributable to one.
    pub component: Option<String>,
    /// Orchestrator state in which the failure was observed.
    pub state: TrialState,
    pub reason: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Rejected trial parameters.  Always raised before any component starts.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("missing trial parameter `{0}`")]
    MissingField(String),

    #[error("trial parameter `{field}` = {value:?} is not a valid {expected}")]
    TypeMismatch {
        field: String,
        value: String,
        expected: String,
    },

    #[error("trial parameter `{field}` = {value} is out of range ({constraint})")]
    OutOfRange {
        field: String,
        value: String,
        constraint: String,
    },

    #[error("unknown trial parameter `{0}`")]
    UnknownField(String),

    #[error("trial output `{0}` already exists")]
    DuplicateTrial(String),
}

/// Topic wiring errors.  These are configuration errors raised when a
/// publisher or subscriber is set up, never silent drops.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("schema mismatch on topic `{topic}`: declared {declared:?}, got {found:?}")]
    SchemaMismatch {
        topic: String,
        declared: Schema,
        found: Schema,
    },

    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
}

/// Trial-level error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialError {
    #[error("invalid trial parameters: {0}")]
    Validation(#[from] ValidationError),

    #[error("component `{component}` not ready after {waited:?}")]
    StartupTimeout { component: String, waited: Duration },

    #[error("input `{component}` degraded after {consecutive_failures} consecutive failed reads")]
    DegradedInput {
        component: String,
        consecutive_failures: u32,
    },

    #[error("recording could not be persisted after {attempts} attempts: {reason}")]
    SealPersistence { attempts: u32, reason: String },

    #[error("trial aborted: {}", format_trail(.trail))]
    Aborted { trail: Vec<AbortEntry> },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("component `{component}` failed: {reason}")]
    Component { component: String, reason: String },

    #[error("sensor replay error: {0}")]
    Replay(String),

    #[error("hardware fault on {device}: {details}")]
    Hardware { device: String, details: String },

    #[error("storage error: {0}")]
    Storage(String),
}

fn format_trail(trail: &[AbortEntry]) -> String {
    trail
        .iter()
        .map(|e| match &e.component {
            Some(c) => format!("[{:?}] {c}: {}", e.state, e.reason),
            None => format!("[{:?}] {}", e.state, e.reason),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_reports_its_schema() {
        let pose = Message::Pose(PoseSample::device(
            0,
            Duration::ZERO,
            Vec3::zero(),
            Quaternion::identity(),
        ));
        assert_eq!(pose.schema(), Schema::Pose);
        assert_eq!(Message::Trigger(Trigger::RecordStart).schema(), Schema::Trigger);
        assert_eq!(Message::Transform(vec![]).schema(), Schema::Transform);
    }

    #[test]
    fn robot_sample_carries_cause() {
        let s = PoseSample::robot(
            7,
            Duration::from_millis(3),
            Vec3::zero(),
            Quaternion::identity(),
            6,
        );
        assert_eq!(s.source, PoseSource::Robot);
        assert_eq!(s.cause, Some(6));
    }

    #[test]
    fn pose_message_roundtrip_is_lossless() {
        let msg = Message::Pose(PoseSample::robot(
            42,
            Duration::new(3, 123_456_789),
            Vec3::new(0.455_900_000_000_001, -0.1, 1.0 / 3.0),
            Quaternion::new(0.0, 1.0, 0.0, 0.0),
            41,
        ));
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn device_sample_omits_cause_field() {
        let s = PoseSample::device(1, Duration::ZERO, Vec3::zero(), Quaternion::identity());
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("cause"));
    }

    #[test]
    fn aborted_error_lists_trail() {
        let err = TrialError::Aborted {
            trail: vec![
                AbortEntry {
                    component: Some("marker_publisher".to_string()),
                    state: TrialState::AwaitingReady,
                    reason: "not ready".to_string(),
                },
                AbortEntry {
                    component: None,
                    state: TrialState::Stopping,
                    reason: "shutdown".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("marker_publisher"));
        assert!(text.contains("AwaitingReady"));
        assert!(text.contains("shutdown"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::OutOfRange {
            field: "autonomy_id".to_string(),
            value: "9".to_string(),
            constraint: "0..=5".to_string(),
        };
        assert!(err.to_string().contains("autonomy_id"));
        let trial: TrialError = err.into();
        assert!(matches!(trial, TrialError::Validation(_)));
    }

    #[test]
    fn terminal_states() {
        assert!(TrialState::Complete.is_terminal());
        assert!(TrialState::Aborted.is_terminal());
        assert!(!TrialState::Running.is_terminal());
    }
}
