//! # Servo loop
//!
//! The servo loop runs at the actuator rate (around 1 kHz) on its own thread. Each tick it:
//!
//!  1. reads the measured state from the actuator and publishes it to the state buffer,
//!  2. mirrors the state into the shadow scene if one is attached and not currently locked,
//!  3. samples the reference buffer at the measured control time,
//!  4. evaluates the control law stored with the reference,
//!  5. sends the resulting command to the actuator.
//!
//! The loop never calls a planner and only ever takes short locks, so planning latency can't make
//! it miss ticks. The same loop drives real hardware and the [`Emulator`], through the
//! [`Actuator`] trait.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod actuator;
pub mod params;
mod run;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::sync::{Arc, PoisonError, RwLock, TryLockError};

use log::trace;
use nalgebra::DVector;

use crate::{
    joint_state::{JointState, StateBufError, StateBuffer},
    ref_buf::{ControlLaw, RefBufError, RefBuffer, RefSample},
    scene::Scene,
};

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use actuator::*;
pub use params::Params;
pub use run::*;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// One servo tick's worth of work, without any threading.
pub struct Servo {
    actuator: Box<dyn Actuator>,
    ref_buf: Arc<RefBuffer>,
    state_buf: Arc<StateBuffer>,

    /// Scene the measured state is mirrored into, if any
    shadow: Option<Arc<RwLock<Scene>>>,

    ticks: u64,
}

/// Outcome of a single tick.
#[derive(Debug, Clone)]
pub struct Tick {
    /// State measured at the start of the tick
    pub state: JointState,

    pub command: ControlCommand,

    /// True if the measured time is after the end of the motion reference
    pub past_spline_end: bool,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ServoError {
    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Could not read the reference: {0}")]
    RefBuf(#[from] RefBufError),

    #[error("Could not publish the measured state: {0}")]
    StateBuf(#[from] StateBufError),

    #[error("Invalid control law: {0}")]
    InvalidLaw(String),

    #[error("Gain matrix is {rows}x{cols}, expected a square matrix of size {dof}")]
    GainDimension { rows: usize, cols: usize, dof: usize },

    #[error("Could not spawn the servo thread: {0}")]
    SpawnError(std::io::Error),

    #[error("The servo thread panicked")]
    ThreadPanicked,

    #[error("Shadow scene lock is poisoned")]
    PoisonError,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Servo {
    pub fn new(
        actuator: Box<dyn Actuator>,
        ref_buf: Arc<RefBuffer>,
        state_buf: Arc<StateBuffer>,
    ) -> Self {
        Self {
            actuator,
            ref_buf,
            state_buf,
            shadow: None,
            ticks: 0,
        }
    }

    /// Mirror the measured state into the given scene every tick.
    pub fn with_shadow(mut self, scene: Arc<RwLock<Scene>>) -> Self {
        self.shadow = Some(scene);
        self
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Execute one tick.
    pub fn step(&mut self) -> Result<Tick, ServoError> {
        // ---- MEASURE ----

        let state = self.actuator.get_state()?;
        self.state_buf.publish(state.clone())?;

        // Never wait on the shadow scene, someone else holding it just means we skip a mirror
        if let Some(ref scene) = self.shadow {
            match scene.try_write() {
                Ok(mut s) => {
                    if let Err(e) = s.set_from(&state) {
                        trace!("Shadow scene not updated: {}", e);
                    }
                }
                Err(TryLockError::WouldBlock) => (),
                Err(TryLockError::Poisoned(_)) => return Err(ServoError::PoisonError),
            }
        }

        // ---- REFERENCE ----

        let snapshot = self.ref_buf.read_at(state.time)?;
        let sample = snapshot.reference.sample(&state.q, &state.q_dot, state.time);

        let past_spline_end = snapshot
            .reference
            .spline()
            .map(|s| state.time > s.end_time())
            .unwrap_or(false);

        // ---- CONTROL ----

        let command = control_command(&snapshot.law, &sample, &state)?;
        self.actuator.send_command(&command)?;

        self.ticks += 1;

        Ok(Tick {
            state,
            command,
            past_spline_end,
        })
    }
}

impl<G> From<PoisonError<G>> for ServoError {
    fn from(_: PoisonError<G>) -> Self {
        Self::PoisonError
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Proportional and derivative gains for a second order response.
///
/// `decay_time` is the time for the error to decay to 10% of its initial value, `damping_ratio`
/// is 1 for critical damping. Returns `(kp, kd)`, both infinite unless the two parameters are
/// positive, see [`ControlLaw::validate`].
pub fn natural_gains(decay_time: f64, damping_ratio: f64) -> (f64, f64) {
    let lambda = -decay_time * damping_ratio / 0.1f64.ln();
    let kp = 1.0 / (lambda * lambda);
    let kd = 2.0 * damping_ratio / lambda;
    (kp, kd)
}

/// Evaluate the control law for a reference sample and measured state.
pub fn control_command(
    law: &ControlLaw,
    sample: &RefSample,
    state: &JointState,
) -> Result<ControlCommand, ServoError> {
    law.validate().map_err(ServoError::InvalidLaw)?;

    match law {
        ControlLaw::ConfigRefs {
            decay_time,
            damping_ratio,
        } => {
            let (kp, kd) = natural_gains(*decay_time, *damping_ratio);
            let acc: DVector<f64> =
                (&sample.q - &state.q) * kp + (&sample.q_dot - &state.q_dot) * kd;
            Ok(ControlCommand::Acceleration(acc))
        }
        ControlLaw::ProjectedAcc { kp, kd } => {
            let dof = state.dof();
            for m in [kp, kd].iter() {
                if m.nrows() != dof || m.ncols() != dof {
                    return Err(ServoError::GainDimension {
                        rows: m.nrows(),
                        cols: m.ncols(),
                        dof,
                    });
                }
            }

            let u = &sample.q_ddot - kp * &state.q - kd * &state.q_dot;
            Ok(ControlCommand::Force(u))
        }
    }
}
