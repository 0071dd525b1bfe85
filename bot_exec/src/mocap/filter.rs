//! Rigid body pose filtering

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Weight given to each new measurement.
pub const FILTER_ALPHA: f64 = 0.1;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A rigid body as reported by the motion capture system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidBody {
    pub name: String,
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,

    /// True if the body was not seen in this frame
    pub occluded: bool,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl RigidBody {
    pub fn new(name: &str, position: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            name: name.into(),
            position,
            rotation,
            occluded: false,
        }
    }

    pub fn pose(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Move `pose` a fraction `alpha` of the way towards `signal`.
///
/// Position is blended linearly and rotation by spherical interpolation.
pub fn pose_filter(pose: &mut Isometry3<f64>, alpha: f64, signal: &Isometry3<f64>) {
    pose.translation.vector =
        pose.translation.vector * (1.0 - alpha) + signal.translation.vector * alpha;

    // Antipodal rotations have no unique slerp, keep the current estimate for those
    if let Some(r) = pose.rotation.try_slerp(&signal.rotation, alpha, 1e-9) {
        pose.rotation = r;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_pose_filter() {
        let mut pose = Isometry3::identity();
        let signal = Isometry3::from_parts(
            Translation3::new(1.0, 0.0, -2.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
        );

        pose_filter(&mut pose, FILTER_ALPHA, &signal);

        assert!((pose.translation.vector - Vector3::new(0.1, 0.0, -0.2)).norm() < 1e-12);
        assert!((pose.rotation.angle() - 0.1 * FRAC_PI_2).abs() < 1e-9);

        // Repeated filtering converges on the signal
        for _ in 0..300 {
            pose_filter(&mut pose, FILTER_ALPHA, &signal);
        }
        assert!((pose.translation.vector - signal.translation.vector).norm() < 1e-9);
        assert!(pose.rotation.angle_to(&signal.rotation) < 1e-9);
    }
}
