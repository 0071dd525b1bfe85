//! Waypoint planner parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Deserialize;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the built in joint space optimizer
#[derive(Deserialize, Debug, Clone)]
pub struct Params {
    /// Number of waypoints generated per phase of the horizon
    pub steps_per_phase: usize,

    /// Amount a waypoint may exceed a joint limit before the plan is infeasible
    ///
    /// Units: rad or m
    pub limit_tolerance: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            steps_per_phase: 1,
            limit_tolerance: 1e-6,
        }
    }
}
