//! # Waypoint planner
//!
//! Solves for a short sequence of untimed waypoints satisfying the current objectives. Every call
//! is re-seeded from the measured joint state. The nonlinear problem itself is delegated to a
//! [`TrajectoryOptimizer`], the planner only keeps the optimizer in step with the scene and turns
//! its output into a [`Plan`].
//!
//! A plan that is not feasible carries no waypoints, and must never be written to the reference
//! buffer.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod joint_space;
mod objective;
pub mod params;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::{debug, trace};
use nalgebra::DVector;
use serde::Serialize;

use crate::scene::{Scene, SceneError};

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use joint_space::*;
pub use objective::*;
pub use params::Params;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// Nonlinear trajectory optimizer used to find waypoints.
pub trait TrajectoryOptimizer: Send {
    /// Solve for a path starting at `seed` that satisfies the objectives.
    ///
    /// An unsatisfiable problem is not an error, it is reported through
    /// [`OptimResult::feasible`].
    fn solve(
        &mut self,
        scene: &Scene,
        flagged: &[Objective],
        running: &[Objective],
        seed: &DVector<f64>,
    ) -> Result<OptimResult, WaypointError>;

    /// Reset any incremental state after the scene structure changed.
    fn reinit(&mut self, scene: &Scene);
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Raw optimizer output.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimResult {
    pub path: Vec<DVector<f64>>,
    pub feasible: bool,

    /// Step durations if the optimizer also timed the path
    pub durations: Option<Vec<f64>>,

    /// Human readable reason the problem was infeasible
    pub message: Option<String>,
}

/// Output of the waypoint planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    /// Empty unless the plan is feasible
    pub waypoints: Vec<DVector<f64>>,

    pub feasible: bool,

    /// Per-step durations, `None` until timed
    pub durations: Option<Vec<f64>>,
}

pub struct WaypointMpc {
    optimizer: Box<dyn TrajectoryOptimizer>,

    /// Scene structure version the optimizer was last initialised against
    structure_version: Option<u64>,

    num_solves: u64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WaypointError {
    #[error("Seed has {found} joints, the scene has {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("Optimizer failed: {0}")]
    Optimizer(String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Plan {
    /// A plan with no waypoints.
    pub fn infeasible() -> Self {
        Self {
            waypoints: Vec::new(),
            feasible: false,
            durations: None,
        }
    }
}

impl WaypointMpc {
    pub fn new(optimizer: Box<dyn TrajectoryOptimizer>) -> Self {
        Self {
            optimizer,
            structure_version: None,
            num_solves: 0,
        }
    }

    /// Waypoint planner using the built in [`JointSpaceOptimizer`].
    pub fn with_joint_space(params: Params) -> Self {
        Self::new(Box::new(JointSpaceOptimizer::new(params)))
    }

    /// Number of optimizer solves so far.
    pub fn num_solves(&self) -> u64 {
        self.num_solves
    }

    /// Reset the optimizer against the current scene.
    pub fn reinit(&mut self, scene: &Scene) {
        debug!(
            "Reinitialising waypoint optimizer (scene structure v{})",
            scene.structure_version()
        );
        self.optimizer.reinit(scene);
        self.structure_version = Some(scene.structure_version());
    }

    /// Solve for waypoints from `current_state`.
    pub fn solve(
        &mut self,
        scene: &Scene,
        current_state: &DVector<f64>,
        objectives: &ObjectiveSet,
    ) -> Result<Plan, WaypointError> {
        if current_state.len() != scene.dof() {
            return Err(WaypointError::DimensionMismatch {
                expected: scene.dof(),
                found: current_state.len(),
            });
        }

        if self.structure_version != Some(scene.structure_version()) {
            self.reinit(scene);
        }

        let result = self.optimizer.solve(
            scene,
            &objectives.flagged,
            &objectives.running,
            current_state,
        )?;
        self.num_solves += 1;

        if !result.feasible {
            trace!(
                "Waypoint solve {} infeasible: {}",
                self.num_solves,
                result.message.as_deref().unwrap_or("no reason given")
            );
            return Ok(Plan::infeasible());
        }

        trace!(
            "Waypoint solve {} feasible with {} waypoints",
            self.num_solves,
            result.path.len()
        );

        Ok(Plan {
            waypoints: result.path,
            feasible: true,
            durations: result.durations,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::Isometry3;

    /// Records how often it was initialised
    struct Counting {
        reinits: usize,
    }

    impl TrajectoryOptimizer for Counting {
        fn solve(
            &mut self,
            _scene: &Scene,
            flagged: &[Objective],
            _running: &[Objective],
            seed: &DVector<f64>,
        ) -> Result<OptimResult, WaypointError> {
            Ok(OptimResult {
                path: vec![seed.clone()],
                feasible: !flagged.is_empty(),
                durations: None,
                message: None,
            })
        }

        fn reinit(&mut self, _scene: &Scene) {
            self.reinits += 1;
        }
    }

    #[test]
    fn test_infeasible_plan_is_empty() {
        let scene = Scene::new(&["a"]);
        let mut mpc = WaypointMpc::new(Box::new(Counting { reinits: 0 }));
        let q = DVector::zeros(1);

        let plan = mpc.solve(&scene, &q, &ObjectiveSet::default()).unwrap();
        assert_eq!(plan, Plan::infeasible());

        let set = ObjectiveSet::new(
            vec![Objective::new("t", Feature::JointTarget, DVector::zeros(1), 1.0)],
            vec![],
        );
        let plan = mpc.solve(&scene, &q, &set).unwrap();
        assert!(plan.feasible);
        assert_eq!(plan.waypoints.len(), 1);
        assert_eq!(mpc.num_solves(), 2);

        assert!(matches!(
            mpc.solve(&scene, &DVector::zeros(2), &set),
            Err(WaypointError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_reinit_on_structure_change() {
        let mut scene = Scene::new(&["a"]);
        let mut mpc = WaypointMpc::new(Box::new(Counting { reinits: 0 }));
        let q = DVector::zeros(1);
        let set = ObjectiveSet::default();

        mpc.solve(&scene, &q, &set).unwrap();
        mpc.solve(&scene, &q, &set).unwrap();
        assert_eq!(mpc.structure_version, Some(0));

        scene
            .add_frame("ball", None, Isometry3::identity())
            .unwrap();
        mpc.solve(&scene, &q, &set).unwrap();
        assert_eq!(mpc.structure_version, Some(1));
    }
}
