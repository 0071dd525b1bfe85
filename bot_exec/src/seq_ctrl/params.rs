//! Sequence controller parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the sequence controller
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Params {
    /// Tracking error above which a waypoint whose arrival time has passed is kept as the target
    ///
    /// Units: rad or m (norm over all joints)
    pub precision: f64,

    /// Length of the frozen window ahead of the current control time. New segments are spliced
    /// in at `ctrl_time + tau_cutoff_s`.
    ///
    /// Units: seconds
    pub tau_cutoff_s: f64,

    /// Maximum control time between two waypoint solves under unchanged objectives
    ///
    /// Units: seconds
    pub replan_cutoff_s: f64,

    /// Smallest change in a referenced frame's pose that counts as an objective change
    ///
    /// Units: m for translation, rad for rotation
    pub pose_tolerance: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            precision: 0.1,
            tau_cutoff_s: 0.1,
            replan_cutoff_s: 0.1,
            pose_tolerance: 1e-3,
        }
    }
}
