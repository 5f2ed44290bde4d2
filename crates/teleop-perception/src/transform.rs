//! Coordinate frame tree.
//!
//! Maintains a directed graph of named frames and the rigid-body transforms
//! that relate them.  Given two frame names the tree composes the chain of
//! transforms between them via BFS.
//!
//! The tree is fed from `tf_static` messages: each [`FrameTransform`]
//! becomes (or replaces) one parent → child edge.
//!
//! # Example
//!
//! ```rust
//! use teleop_perception::FrameTree;
//! use teleop_types::{FrameTransform, Quaternion, Transform3D, Vec3};
//!
//! let mut tree = FrameTree::new();
//! tree.ingest(&[
//!     FrameTransform::new("panda_link0", "camera_base",
//!         Transform3D::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::identity())),
//!     FrameTransform::new("camera_base", "depth_camera",
//!         Transform3D::new(Vec3::new(0.0, 0.0, 0.5), Quaternion::identity())),
//! ]);
//!
//! let t = tree.lookup("panda_link0", "depth_camera").unwrap();
//! assert!((t.translation.z - 0.5).abs() < 1e-12);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use teleop_types::{FrameTransform, Transform3D};
use tracing::debug;

/// Directed graph of frames.  Adding `A → B` does not create `B → A`.
#[derive(Debug, Default, Clone)]
pub struct FrameTree {
    /// `edges[parent][child] = T_parent_child`
    edges: HashMap<String, HashMap<String, Transform3D>>,
}

impl FrameTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the transform from `parent` to `child`.
    pub fn set_transform(&mut self, parent: &str, child: &str, transform: Transform3D) {
        self.edges
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string(), transform);
    }

    /// Register every transform of a `tf_static` message.
    pub fn ingest(&mut self, transforms: &[FrameTransform]) {
        for t in transforms {
            debug!(parent = %t.parent, child = %t.child, "frame transform updated");
            self.set_transform(&t.parent, &t.child, t.transform);
        }
    }

    /// Number of registered edges.
    pub fn len(&self) -> usize {
        self.edges.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pose of `target` expressed in `source`, or `None` when the frames
    /// are not connected.
    pub fn lookup(&self, source: &str, target: &str) -> Option<Transform3D> {
        if source == target {
            return Some(Transform3D::identity());
        }

        // Each queue item carries the transform accumulated from `source`.
        let mut queue: VecDeque<(&str, Transform3D)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        queue.push_back((source, Transform3D::identity()));
        visited.insert(source);

        while let Some((current, accumulated)) = queue.pop_front() {
            let Some(children) = self.edges.get(current) else {
                continue;
            };
            for (next, edge) in children {
                if !visited.insert(next.as_str()) {
                    continue;
                }
                let composed = accumulated.compose(*edge);
                if next == target {
                    return Some(composed);
                }
                queue.push_back((next.as_str(), composed));
            }
        }
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
