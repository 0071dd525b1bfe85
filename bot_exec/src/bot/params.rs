//! Bot operator parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Deserialize;

use crate::ref_buf::ControlLaw;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the bot operator
#[derive(Deserialize, Debug, Clone)]
pub struct Params {
    /// Home configuration. If empty the configuration measured at startup is used.
    ///
    /// Units: rad or m per joint
    #[serde(default)]
    pub q_home: Vec<f64>,

    /// Control law the servo loop starts with
    #[serde(default)]
    pub control_law: ControlLaw,

    /// Time `step` waits after mirroring the state into the scene
    ///
    /// Units: seconds
    pub step_wait_s: f64,

    /// How long to wait for the servo loop to publish a state before giving up
    ///
    /// Units: seconds
    pub state_timeout_s: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            q_home: Vec::new(),
            control_law: ControlLaw::default(),
            step_wait_s: 0.1,
            state_timeout_s: 1.0,
        }
    }
}
