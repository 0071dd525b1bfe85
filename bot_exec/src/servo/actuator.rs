//! Actuator interface and the emulated plant

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::joint_state::JointState;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// Actuator-level I/O used by the servo loop.
///
/// Implemented by real robot drivers and by the [`Emulator`].
pub trait Actuator: Send {
    /// Read the measured joint state.
    fn get_state(&mut self) -> Result<JointState, ActuatorError>;

    /// Apply a command for the coming tick.
    fn send_command(&mut self, cmd: &ControlCommand) -> Result<(), ActuatorError>;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Emulated plant: a double integrator per joint.
///
/// Every command advances the emulated time by `tau` using a symmetric (leapfrog) update:
///
/// ```text
/// q     += 0.5 tau q_dot
/// q_dot += tau a
/// q     += 0.5 tau q_dot
/// ```
#[derive(Debug, Clone)]
pub struct Emulator {
    state: JointState,
    tau: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Command sent to the actuator every servo tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Desired joint acceleration
    Acceleration(DVector<f64>),

    /// Generalised force from the projected law
    Force(DVector<f64>),
}

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("Command has {found} joints, the actuator has {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Actuator fault: {0}")]
    Fault(String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ControlCommand {
    pub fn values(&self) -> &DVector<f64> {
        match self {
            ControlCommand::Acceleration(v) => v,
            ControlCommand::Force(v) => v,
        }
    }
}

impl Emulator {
    /// Create an emulator at rest in `q` at time zero.
    pub fn new(q: DVector<f64>, tau: f64) -> Self {
        Self {
            state: JointState::at_rest(q, 0.0),
            tau,
        }
    }

    pub fn from_state(state: JointState, tau: f64) -> Self {
        Self { state, tau }
    }

    pub fn state(&self) -> &JointState {
        &self.state
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }
}

impl Actuator for Emulator {
    fn get_state(&mut self) -> Result<JointState, ActuatorError> {
        Ok(self.state.clone())
    }

    fn send_command(&mut self, cmd: &ControlCommand) -> Result<(), ActuatorError> {
        // The plant has unit inertia so a force is the same as an acceleration
        let acc = cmd.values();

        if acc.len() != self.state.dof() {
            return Err(ActuatorError::DimensionMismatch {
                expected: self.state.dof(),
                found: acc.len(),
            });
        }

        let half = 0.5 * self.tau;
        let s = &mut self.state;

        s.q += &s.q_dot * half;
        s.q_dot += acc * self.tau;
        s.q += &s.q_dot * half;
        s.time += self.tau;

        Ok(())
    }
}
