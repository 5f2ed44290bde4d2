//! Summaries of persisted recordings.

use std::time::Duration;

use teleop_perception::ReferenceTrajectory;
use teleop_runtime::{SealReason, TrialRecording};
use teleop_types::Vec3;

const REFERENCE_SAMPLES: usize = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub key: String,
    pub duration: Duration,
    pub seal_reason: SealReason,
    pub device_samples: usize,
    pub robot_samples: usize,
    /// Mean device rate over the window, Hz.
    pub device_rate_hz: f64,
    /// Length of the robot target path, metres.
    pub path_length_m: f64,
    /// Distance from each robot target to the nearest reference point.
    pub mean_tracking_error_m: Option<f64>,
    pub max_tracking_error_m: Option<f64>,
}

pub fn summarize(recording: &TrialRecording) -> RecordingSummary {
    let robot: Vec<Vec3> = recording.robot_samples().map(|s| s.position).collect();
    let device_samples = recording.device_samples().count();
    let secs = recording.duration.as_secs_f64();

    let path_length_m = robot.windows(2).map(|w| w[0].distance(w[1])).sum();

    let (mean, max) = match ReferenceTrajectory::for_id(recording.key.trajectory_id) {
        Some(reference) if !robot.is_empty() => {
            let reference = reference.path(REFERENCE_SAMPLES);
            let errors: Vec<f64> = robot
                .iter()
                .map(|p| {
                    reference
                        .iter()
                        .map(|r| r.distance(*p))
                        .fold(f64::INFINITY, f64::min)
                })
                .collect();
            let mean = errors.iter().sum::<f64>() / errors.len() as f64;
            let max = errors.iter().copied().fold(0.0, f64::max);
            (Some(mean), Some(max))
        }
        _ => (None, None),
    };

    RecordingSummary {
        key: recording.key.to_string(),
        duration: recording.duration,
        seal_reason: recording.seal_reason,
        device_samples,
        robot_samples: robot.len(),
        device_rate_hz: if secs > 0.0 { device_samples as f64 / secs } else { 0.0 },
        path_length_m,
        mean_tracking_error_m: mean,
        max_tracking_error_m: max,
    }
}
