//! # Scene model
//!
//! Minimal kinematic scene: the robot's joint state plus a tree of named frames. Objectives refer
//! to frames by name, and the motion capture stream writes tracked bodies into it.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use nalgebra::{DVector, Isometry3, Vector3};
use serde::{Deserialize, Serialize};

use crate::joint_state::JointState;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Maximum frame tree depth, guards against cycles when resolving world poses.
const MAX_FRAME_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A named frame in the scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Name of the parent frame, `None` if attached to the world.
    pub parent: Option<String>,

    /// Pose relative to the parent (or world).
    pub rel_pose: Isometry3<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    joint_names: Vec<String>,
    q: DVector<f64>,
    q_dot: DVector<f64>,
    frames: HashMap<String, Frame>,

    /// Incremented every time a frame is added or removed
    structure_version: u64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("Expected a joint vector of length {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("No frame named \"{0}\" in the scene")]
    UnknownFrame(String),

    #[error("Frame \"{0}\" already exists")]
    FrameExists(String),

    #[error("Frame tree around \"{0}\" is deeper than allowed, is there a cycle?")]
    FrameTreeTooDeep(String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Frame {
    pub fn new(parent: Option<&str>, rel_pose: Isometry3<f64>) -> Self {
        Self {
            parent: parent.map(String::from),
            rel_pose,
        }
    }
}

impl Scene {
    /// Create a scene with the given joints, all at zero.
    pub fn new<S: AsRef<str>>(joint_names: &[S]) -> Self {
        let n = joint_names.len();
        Self {
            joint_names: joint_names.iter().map(|s| s.as_ref().to_string()).collect(),
            q: DVector::zeros(n),
            q_dot: DVector::zeros(n),
            frames: HashMap::new(),
            structure_version: 0,
        }
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    pub fn dof(&self) -> usize {
        self.joint_names.len()
    }

    pub fn joint_state(&self) -> &DVector<f64> {
        &self.q
    }

    pub fn joint_velocity(&self) -> &DVector<f64> {
        &self.q_dot
    }

    /// Set the joint positions, zeroing the velocities.
    pub fn set_joint_state(&mut self, q: &DVector<f64>) -> Result<(), SceneError> {
        self.check_dim(q.len())?;
        self.q.copy_from(q);
        self.q_dot.fill(0.0);
        Ok(())
    }

    /// Mirror a measured joint state into the scene.
    pub fn set_from(&mut self, state: &JointState) -> Result<(), SceneError> {
        self.check_dim(state.q.len())?;
        self.check_dim(state.q_dot.len())?;
        self.q.copy_from(&state.q);
        self.q_dot.copy_from(&state.q_dot);
        Ok(())
    }

    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub fn has_frame(&self, name: &str) -> bool {
        self.frames.contains_key(name)
    }

    pub fn frame(&self, name: &str) -> Option<&Frame> {
        self.frames.get(name)
    }

    pub fn frame_names(&self) -> impl Iterator<Item = &String> {
        self.frames.keys()
    }

    /// Add a new frame. The parent, if any, must already exist.
    pub fn add_frame(
        &mut self,
        name: &str,
        parent: Option<&str>,
        rel_pose: Isometry3<f64>,
    ) -> Result<&mut Frame, SceneError> {
        if self.frames.contains_key(name) {
            return Err(SceneError::FrameExists(name.into()));
        }
        if let Some(p) = parent {
            if !self.frames.contains_key(p) {
                return Err(SceneError::UnknownFrame(p.into()));
            }
        }

        self.structure_version += 1;

        Ok(self
            .frames
            .entry(name.to_string())
            .or_insert_with(|| Frame::new(parent, rel_pose)))
    }

    /// Remove a frame, reattaching its children to the world at their current world pose.
    pub fn remove_frame(&mut self, name: &str) -> Result<Frame, SceneError> {
        let children: Vec<String> = self
            .frames
            .iter()
            .filter(|(_, f)| f.parent.as_deref() == Some(name))
            .map(|(n, _)| n.clone())
            .collect();

        for child in children {
            let world = self.world_pose(&child)?;
            if let Some(f) = self.frames.get_mut(&child) {
                f.parent = None;
                f.rel_pose = world;
            }
        }

        let frame = self
            .frames
            .remove(name)
            .ok_or_else(|| SceneError::UnknownFrame(name.into()))?;

        self.structure_version += 1;

        Ok(frame)
    }

    /// Set the pose of a frame relative to its parent.
    pub fn set_rel_pose(&mut self, name: &str, pose: Isometry3<f64>) -> Result<(), SceneError> {
        match self.frames.get_mut(name) {
            Some(f) => {
                f.rel_pose = pose;
                Ok(())
            }
            None => Err(SceneError::UnknownFrame(name.into())),
        }
    }

    /// Set the world position of a frame, keeping its orientation.
    pub fn set_position(&mut self, name: &str, position: Vector3<f64>) -> Result<(), SceneError> {
        let parent_pose = match self.frames.get(name) {
            Some(f) => match f.parent {
                Some(ref p) => self.world_pose(p)?,
                None => Isometry3::identity(),
            },
            None => return Err(SceneError::UnknownFrame(name.into())),
        };

        let local = parent_pose.inverse_transform_point(&position.into());

        match self.frames.get_mut(name) {
            Some(f) => {
                f.rel_pose.translation.vector = local.coords;
                Ok(())
            }
            None => Err(SceneError::UnknownFrame(name.into())),
        }
    }

    /// Pose of a frame in the world.
    pub fn world_pose(&self, name: &str) -> Result<Isometry3<f64>, SceneError> {
        let mut pose = Isometry3::identity();
        let mut current = Some(name);

        for _ in 0..MAX_FRAME_DEPTH {
            let n = match current {
                Some(n) => n,
                None => return Ok(pose),
            };

            let frame = self
                .frames
                .get(n)
                .ok_or_else(|| SceneError::UnknownFrame(n.into()))?;

            pose = frame.rel_pose * pose;
            current = frame.parent.as_deref();
        }

        match current {
            None => Ok(pose),
            Some(_) => Err(SceneError::FrameTreeTooDeep(name.into())),
        }
    }

    /// World position of a frame.
    pub fn position(&self, name: &str) -> Result<Vector3<f64>, SceneError> {
        Ok(self.world_pose(name)?.translation.vector)
    }

    fn check_dim(&self, found: usize) -> Result<(), SceneError> {
        if found != self.dof() {
            Err(SceneError::DimensionMismatch {
                expected: self.dof(),
                found,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_world_pose_chain() {
        let mut scene = Scene::new(&["x", "y", "z"]);

        scene
            .add_frame(
                "table",
                None,
                Isometry3::from_parts(
                    Translation3::new(1.0, 0.0, 0.5),
                    UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
                ),
            )
            .unwrap();
        scene
            .add_frame(
                "ball",
                Some("table"),
                Isometry3::translation(1.0, 0.0, 0.0),
            )
            .unwrap();

        let p = scene.position("ball").unwrap();
        assert!((p - Vector3::new(1.0, 1.0, 0.5)).norm() < 1e-12);
        assert_eq!(scene.structure_version(), 2);

        // Moving the ball in world coordinates goes through the parent transform
        scene.set_position("ball", Vector3::new(1.0, 2.0, 0.5)).unwrap();
        let rel = scene.frame("ball").unwrap().rel_pose.translation.vector;
        assert!((rel - Vector3::new(2.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_remove_frame_reparents_children() {
        let mut scene = Scene::new(&["x"]);
        scene
            .add_frame("base", None, Isometry3::translation(0.0, 0.0, 1.0))
            .unwrap();
        scene
            .add_frame("marker", Some("base"), Isometry3::translation(0.5, 0.0, 0.0))
            .unwrap();

        scene.remove_frame("base").unwrap();

        assert!(scene.frame("marker").unwrap().parent.is_none());
        let p = scene.position("marker").unwrap();
        assert!((p - Vector3::new(0.5, 0.0, 1.0)).norm() < 1e-12);
        assert_eq!(scene.structure_version(), 3);
        assert!(matches!(
            scene.remove_frame("base"),
            Err(SceneError::UnknownFrame(_))
        ));
    }

    #[test]
    fn test_joint_state_dimension_check() {
        let mut scene = Scene::new(&["a", "b"]);
        assert!(scene.set_joint_state(&DVector::from_vec(vec![0.1, 0.2])).is_ok());
        assert!(matches!(
            scene.set_joint_state(&DVector::from_vec(vec![0.1])),
            Err(SceneError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        ));
    }
}
