//! Timing planner parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Deserialize;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the timing planner.
///
/// Per-joint bounds may be given as a single value, which applies to every joint.
#[derive(Deserialize, Debug, Clone)]
pub struct Params {
    /// Maximum joint velocity
    ///
    /// Units: rad/s or m/s
    pub max_vel: Vec<f64>,

    /// Maximum joint acceleration
    ///
    /// Units: rad/s^2 or m/s^2
    pub max_acc: Vec<f64>,

    /// Optional maximum joint jerk
    ///
    /// Units: rad/s^3 or m/s^3
    #[serde(default)]
    pub max_jerk: Option<Vec<f64>>,

    /// Weight on total duration, higher values give shorter motions.
    pub time_cost: f64,

    /// Weight on control effort, higher values give slower and smoother motions.
    pub ctrl_cost: f64,

    /// Shortest duration given to any segment
    ///
    /// Units: seconds
    pub min_segment_s: f64,

    /// Factor a segment's duration is multiplied by when it violates a bound
    pub growth_factor: f64,

    /// Number of times the durations may be grown before giving up
    pub max_iters: usize,

    /// Number of points each segment is sampled at when checking bounds
    pub samples_per_segment: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_vel: vec![1.0],
            max_acc: vec![4.0],
            max_jerk: None,
            time_cost: 1.0,
            ctrl_cost: 1.0,
            min_segment_s: 0.01,
            growth_factor: 1.1,
            max_iters: 200,
            samples_per_segment: 10,
        }
    }
}
