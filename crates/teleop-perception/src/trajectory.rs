//! Reference trajectories.
//!
//! Every trial asks the operator to follow one of six spirals around the
//! workspace origin.  All spirals share the same shape (radius 0.1 m, one
//! 0.2 m rise over two revolutions) and differ only by their orientation:
//!
//! | `trajectory_id` | Rotation of the base spiral |
//! |---|---|
//! | 0 | none |
//! | 1 | 90° about X |
//! | 2 | 90° about Y |
//! | 3 | 30° about X |
//! | 4 | 30° about Y |
//! | 5 | 70° about X |
//!
//! The target zone is a small sphere around the spiral's start point where
//! the operator places the tool before recording begins.

use std::f64::consts::TAU;

use teleop_types::{Quaternion, Vec3};

/// Robot-base position the haptic workspace is mapped around, metres.
pub const WORKSPACE_ORIGIN: Vec3 = Vec3 {
    x: 0.4559,
    y: 0.0,
    z: 0.3846,
};

pub const SPIRAL_RADIUS: f64 = 0.1;
pub const SPIRAL_HEIGHT: f64 = 0.2;
pub const TARGET_ZONE_RADIUS: f64 = 0.02;

/// Largest valid `trajectory_id`.
pub const MAX_TRAJECTORY_ID: u8 = 5;

/// Sphere the operator must reach before a trial starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetZone {
    pub center: Vec3,
    pub radius: f64,
}

impl TargetZone {
    pub fn contains(&self, point: Vec3) -> bool {
        self.center.distance(point) <= self.radius
    }
}

/// The spiral for one `trajectory_id`, in the robot base frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceTrajectory {
    id: u8,
    rotation: Quaternion,
    origin: Vec3,
}

impl ReferenceTrajectory {
    /// `None` for ids outside `0..=5`.
    pub fn for_id(id: u8) -> Option<Self> {
        let x = Vec3::new(1.0, 0.0, 0.0);
        let y = Vec3::new(0.0, 1.0, 0.0);
        let rotation = match id {
            0 => Quaternion::identity(),
            1 => Quaternion::from_axis_angle(x, 90f64.to_radians()),
            2 => Quaternion::from_axis_angle(y, 90f64.to_radians()),
            3 => Quaternion::from_axis_angle(x, 30f64.to_radians()),
            4 => Quaternion::from_axis_angle(y, 30f64.to_radians()),
            5 => Quaternion::from_axis_angle(x, 70f64.to_radians()),
            _ => return None,
        };
        Some(Self {
            id,
            rotation,
            origin: WORKSPACE_ORIGIN,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Point at curve parameter `t`, clamped to `[0, 2π]`.
    pub fn point(&self, t: f64) -> Vec3 {
        let t = t.clamp(0.0, TAU);
        let local = Vec3::new(
            SPIRAL_RADIUS * (2.0 * t).sin(),
            SPIRAL_RADIUS * (2.0 * t).cos(),
            -SPIRAL_HEIGHT / 2.0 + t / TAU * SPIRAL_HEIGHT,
        );
        self.origin.add(self.rotation.rotate(local))
    }

    pub fn start(&self) -> Vec3 {
        self.point(0.0)
    }

    pub fn end(&self) -> Vec3 {
        self.point(TAU)
    }

    /// `samples` evenly spaced points from start to end (at least two).
    pub fn path(&self, samples: usize) -> Vec<Vec3> {
        let n = samples.max(2);
        (0..n)
            .map(|i| self.point(TAU * i as f64 / (n - 1) as f64))
            .collect()
    }

    pub fn target_zone(&self) -> TargetZone {
        TargetZone {
            center: self.start(),
            radius: TARGET_ZONE_RADIUS,
        }
    }
}
