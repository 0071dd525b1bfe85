//! Servo loop parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Deserialize;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the servo loop
#[derive(Deserialize, Debug, Clone)]
pub struct Params {
    /// Servo period
    ///
    /// Units: seconds
    pub tau_s: f64,

    /// Stop the loop once control time passes the end of the motion reference.
    pub stop_on_spline_end: bool,

    /// Report the tick count and overruns every this many ticks, 0 to disable
    pub report_every_ticks: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            tau_s: 0.001,
            stop_on_spline_end: false,
            report_every_ticks: 0,
        }
    }
}
