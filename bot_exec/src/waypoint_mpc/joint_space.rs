//! Joint space optimizer
//!
//! A direct optimizer for robots whose leading joints form a Cartesian gantry. Each phase of the
//! horizon gets a target configuration built from the objectives applying at that phase, and
//! waypoints are interpolated linearly between consecutive targets. Joint limits are checked on
//! every waypoint.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::debug;
use nalgebra::{DVector, Vector3};

use super::{
    Feature, Objective, OptimResult, Params, TrajectoryOptimizer, WaypointError, MAX_PHASES,
};
use crate::scene::Scene;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of gantry joints a frame target is mapped onto.
const GANTRY_DOF: usize = 3;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub struct JointSpaceOptimizer {
    params: Params,

    /// Number of joints of the scene the optimizer was initialised with
    dof: Option<usize>,
}

/// Box bounds on the joints.
struct Limits {
    lower: DVector<f64>,
    upper: DVector<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl JointSpaceOptimizer {
    pub fn new(params: Params) -> Self {
        Self { params, dof: None }
    }

    /// Configuration required by a single objective, starting from `q`.
    fn apply(&self, scene: &Scene, obj: &Objective, q: &mut DVector<f64>) -> Result<(), String> {
        match obj.feature {
            Feature::JointTarget => {
                if obj.target.len() != q.len() {
                    return Err(format!(
                        "{}: joint target has {} entries for {} joints",
                        obj.name,
                        obj.target.len(),
                        q.len()
                    ));
                }
                q.copy_from(&obj.target);
                Ok(())
            }
            Feature::FrameTarget => {
                if q.len() < GANTRY_DOF {
                    return Err(format!(
                        "{}: frame targets need at least {} joints",
                        obj.name, GANTRY_DOF
                    ));
                }

                let frame = obj
                    .frames
                    .first()
                    .ok_or_else(|| format!("{}: no frame given", obj.name))?;
                let position = scene
                    .position(frame)
                    .map_err(|e| format!("{}: {}", obj.name, e))?;

                let offset = match obj.target.len() {
                    0 => Vector3::zeros(),
                    GANTRY_DOF => Vector3::new(obj.target[0], obj.target[1], obj.target[2]),
                    n => return Err(format!("{}: offset has {} entries", obj.name, n)),
                };

                let goal = position + offset;
                for i in 0..GANTRY_DOF {
                    q[i] = goal[i];
                }
                Ok(())
            }
            Feature::JointLimits => Ok(()),
            Feature::Other(ref f) => Err(format!("{}: unsupported feature {}", obj.name, f)),
        }
    }
}

impl TrajectoryOptimizer for JointSpaceOptimizer {
    fn solve(
        &mut self,
        scene: &Scene,
        flagged: &[Objective],
        running: &[Objective],
        seed: &DVector<f64>,
    ) -> Result<OptimResult, WaypointError> {
        let dof = self.dof.unwrap_or_else(|| scene.dof());
        if seed.len() != dof {
            return Err(WaypointError::DimensionMismatch {
                expected: dof,
                found: seed.len(),
            });
        }

        let active: Vec<&Objective> = flagged
            .iter()
            .chain(running.iter())
            .filter(|o| o.is_active())
            .collect();

        // ---- LIMITS ----

        let mut limits: Option<Limits> = None;
        for obj in active.iter().filter(|o| o.feature == Feature::JointLimits) {
            if obj.target.len() != 2 * dof {
                return Ok(infeasible(format!(
                    "{}: limits have {} entries for {} joints",
                    obj.name,
                    obj.target.len(),
                    dof
                )));
            }

            let lower = obj.target.rows(0, dof).into_owned();
            let upper = obj.target.rows(dof, dof).into_owned();

            // Intersect with any previous limits
            limits = Some(match limits {
                Some(l) => Limits {
                    lower: l.lower.sup(&lower),
                    upper: l.upper.inf(&upper),
                },
                None => Limits { lower, upper },
            });
        }

        // ---- PHASE TARGETS ----

        let mut num_phases = 1;
        for obj in active.iter().filter(|o| o.feature != Feature::JointLimits) {
            match obj.phase_index() {
                Some(p) => num_phases = num_phases.max(p),
                None => {
                    return Ok(infeasible(format!(
                        "{}: phase {} is outside the horizon of {} phases",
                        obj.name, obj.phase, MAX_PHASES
                    )))
                }
            }
        }

        let steps = self.params.steps_per_phase.max(1);
        let mut path = Vec::with_capacity(num_phases * steps);
        let mut prev = seed.clone();

        for phase in 1..=num_phases {
            let mut target = prev.clone();

            for obj in active
                .iter()
                .filter(|o| o.phase_index() == Some(phase))
            {
                if let Err(msg) = self.apply(scene, obj, &mut target) {
                    return Ok(infeasible(msg));
                }
            }

            for s in 1..=steps {
                let alpha = s as f64 / steps as f64;
                path.push(&prev + (&target - &prev) * alpha);
            }

            prev = target;
        }

        // ---- LIMIT CHECK ----

        if let Some(l) = limits {
            let tol = self.params.limit_tolerance;
            for (i, w) in path.iter().enumerate() {
                for j in 0..dof {
                    if w[j] < l.lower[j] - tol || w[j] > l.upper[j] + tol {
                        return Ok(infeasible(format!(
                            "waypoint {} joint {} at {:.4} outside [{:.4}, {:.4}]",
                            i, j, w[j], l.lower[j], l.upper[j]
                        )));
                    }
                }
            }
        }

        Ok(OptimResult {
            path,
            feasible: true,
            durations: None,
            message: None,
        })
    }

    fn reinit(&mut self, scene: &Scene) {
        debug!("Joint space optimizer initialised with {} joints", scene.dof());
        self.dof = Some(scene.dof());
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn infeasible(message: String) -> OptimResult {
    OptimResult {
        path: Vec::new(),
        feasible: false,
        durations: None,
        message: Some(message),
    }
}
