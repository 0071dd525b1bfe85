//! Objectives handed to the trajectory optimizer

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Furthest phase an objective may apply in.
pub const MAX_PHASES: usize = 1000;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A single objective of the waypoint problem.
///
/// The planner does not interpret objectives itself, they are passed on to the
/// [`TrajectoryOptimizer`](super::TrajectoryOptimizer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,

    pub feature: Feature,

    /// Scene frames the feature refers to
    #[serde(default)]
    pub frames: Vec<String>,

    /// Target value of the feature
    pub target: DVector<f64>,

    /// Phase within the horizon at which the objective applies, 1.0 is the end of the first
    /// phase
    pub phase: f64,

    /// Weight of the objective, non-positive disables it
    pub scale: f64,
}

/// Objectives split by how they are enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveSet {
    /// Only active for the horizon being (re)planned. A change to any of them, or to a frame they
    /// reference, triggers a re-plan.
    pub flagged: Vec<Objective>,

    /// Enforced on every solve
    pub running: Vec<Objective>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Feature {
    /// Reach the joint configuration in `target`
    JointTarget,

    /// Put the leading joints at the first referenced frame's position plus the offset in
    /// `target`
    FrameTarget,

    /// Keep all joints within bounds, `target` holds the lower bounds followed by the upper bounds
    JointLimits,

    /// A feature only some optimizers understand
    Other(String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Objective {
    pub fn new(name: &str, feature: Feature, target: DVector<f64>, phase: f64) -> Self {
        Self {
            name: name.into(),
            feature,
            frames: Vec::new(),
            target,
            phase,
            scale: 1.0,
        }
    }

    /// Reference the given scene frames.
    pub fn with_frames<S: AsRef<str>>(mut self, frames: &[S]) -> Self {
        self.frames = frames.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn is_active(&self) -> bool {
        self.scale > 0.0
    }

    /// Phase the objective applies in, counting from 1.
    ///
    /// `None` if `phase` is not finite or past [`MAX_PHASES`].
    pub fn phase_index(&self) -> Option<usize> {
        if !self.phase.is_finite() || self.phase > MAX_PHASES as f64 {
            return None;
        }
        Some(self.phase.ceil().max(1.0) as usize)
    }
}

impl ObjectiveSet {
    pub fn new(flagged: Vec<Objective>, running: Vec<Objective>) -> Self {
        Self { flagged, running }
    }

    /// Names of all frames referenced by flagged objectives, without duplicates.
    pub fn flagged_frames(&self) -> Vec<String> {
        let mut frames: Vec<String> = self
            .flagged
            .iter()
            .flat_map(|o| o.frames.iter().cloned())
            .collect();
        frames.sort();
        frames.dedup();
        frames
    }

    /// Find a flagged objective by name.
    pub fn flagged_mut(&mut self, name: &str) -> Option<&mut Objective> {
        self.flagged.iter_mut().find(|o| o.name == name)
    }

    /// Last valid phase referenced by any active objective, at least 1.
    pub fn horizon_phases(&self) -> usize {
        self.flagged
            .iter()
            .chain(self.running.iter())
            .filter(|o| o.is_active() && o.feature != Feature::JointLimits)
            .filter_map(|o| o.phase_index())
            .max()
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flagged_frames_and_horizon() {
        let set = ObjectiveSet::new(
            vec![
                Objective::new("reach", Feature::FrameTarget, DVector::zeros(3), 1.0)
                    .with_frames(&["ball"]),
                Objective::new("above", Feature::FrameTarget, DVector::zeros(3), 2.5)
                    .with_frames(&["ball", "table"]),
                Objective::new("off", Feature::JointTarget, DVector::zeros(3), 7.0)
                    .with_scale(0.0),
            ],
            vec![Objective::new(
                "limits",
                Feature::JointLimits,
                DVector::zeros(6),
                10.0,
            )],
        );

        assert_eq!(set.flagged_frames(), vec!["ball".to_string(), "table".to_string()]);

        // Disabled objectives and limits don't extend the horizon
        assert_eq!(set.horizon_phases(), 3);
        assert_eq!(ObjectiveSet::default().horizon_phases(), 1);
    }

    #[test]
    fn test_phase_index() {
        let at = |phase: f64| Objective::new("o", Feature::JointTarget, DVector::zeros(1), phase);

        assert_eq!(at(0.0).phase_index(), Some(1));
        assert_eq!(at(1.0).phase_index(), Some(1));
        assert_eq!(at(1.2).phase_index(), Some(2));
        assert_eq!(at(MAX_PHASES as f64).phase_index(), Some(MAX_PHASES));

        assert_eq!(at(f64::NAN).phase_index(), None);
        assert_eq!(at(f64::INFINITY).phase_index(), None);
        assert_eq!(at(1e300).phase_index(), None);
    }
}
