//! `teleop-perception` – spatial context for a trial.
//!
//! # Modules
//!
//! - [`transform`] – [`FrameTree`]: named coordinate frames and the static
//!   transforms between them, with chained lookups.
//! - [`trajectory`] – [`ReferenceTrajectory`]: the spiral the operator is
//!   asked to follow for each `trajectory_id`, and its start target zone.

pub mod trajectory;
pub mod transform;

pub use trajectory::{ReferenceTrajectory, TargetZone, WORKSPACE_ORIGIN};
pub use transform::FrameTree;
