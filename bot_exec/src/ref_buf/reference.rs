//! Reference and control law types

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::spline::CubicSpline;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Hold the robot in place, or let it float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldReference {
    /// Position to hold. If `None` the measured position is passed through, so there is no
    /// position feedback.
    pub position: Option<DVector<f64>>,

    /// Velocity to track.
    pub velocity: VelocityTarget,
}

/// Reference values handed to the servo for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RefSample {
    pub q: DVector<f64>,
    pub q_dot: DVector<f64>,
    pub q_ddot: DVector<f64>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// What the robot should currently do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reference {
    /// Follow a spline over control time.
    Motion(CubicSpline),

    /// Hold position or float.
    Hold(HoldReference),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VelocityTarget {
    /// No velocity reference, the measured velocity is passed through and damping is disabled.
    Free,

    /// Track zero velocity, i.e. damp all motion.
    Zero,

    /// Track a fixed joint velocity.
    Fixed(DVector<f64>),
}

/// Control law used by the servo loop, stored alongside the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlLaw {
    /// Configuration tracking with gains derived from a critically damped response.
    ///
    /// `decay_time` is the time for the error to fall to 10%, `damping_ratio` is 1 for critical
    /// damping.
    ConfigRefs { decay_time: f64, damping_ratio: f64 },

    /// Projected operational-space law, `u = q_ddot_ref - Kp q - Kd q_dot`.
    ProjectedAcc { kp: DMatrix<f64>, kd: DMatrix<f64> },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl HoldReference {
    /// Hold a fixed configuration with damping.
    pub fn at(position: DVector<f64>) -> Self {
        Self {
            position: Some(position),
            velocity: VelocityTarget::Zero,
        }
    }

    /// Float, optionally damping velocity.
    pub fn floating(damping: bool) -> Self {
        Self {
            position: None,
            velocity: if damping {
                VelocityTarget::Zero
            } else {
                VelocityTarget::Free
            },
        }
    }
}

impl Reference {
    /// Sample the reference at `time`, given the measured state.
    pub fn sample(&self, q_real: &DVector<f64>, q_dot_real: &DVector<f64>, time: f64) -> RefSample {
        match self {
            Reference::Motion(spline) => {
                let s = spline.eval(time);
                RefSample {
                    q: s.pos,
                    q_dot: s.vel,
                    q_ddot: s.acc,
                }
            }
            Reference::Hold(hold) => {
                let q = match hold.position {
                    Some(ref p) => p.clone(),
                    None => q_real.clone(),
                };
                let q_dot = match hold.velocity {
                    VelocityTarget::Free => q_dot_real.clone(),
                    VelocityTarget::Zero => DVector::zeros(q_dot_real.len()),
                    VelocityTarget::Fixed(ref v) => v.clone(),
                };
                RefSample {
                    q_ddot: DVector::zeros(q.len()),
                    q,
                    q_dot,
                }
            }
        }
    }

    pub fn spline(&self) -> Option<&CubicSpline> {
        match self {
            Reference::Motion(s) => Some(s),
            Reference::Hold(_) => None,
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, Reference::Hold(_))
    }
}

impl ControlLaw {
    /// Check the law can be evaluated, returning the reason if it can't.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ControlLaw::ConfigRefs {
                decay_time,
                damping_ratio,
            } => {
                if !decay_time.is_finite() || *decay_time <= 0.0 {
                    Err(format!("decay time must be positive, got {}", decay_time))
                } else if !damping_ratio.is_finite() || *damping_ratio <= 0.0 {
                    Err(format!("damping ratio must be positive, got {}", damping_ratio))
                } else {
                    Ok(())
                }
            }
            ControlLaw::ProjectedAcc { kp, kd } => {
                if kp.iter().chain(kd.iter()).all(|g| g.is_finite()) {
                    Ok(())
                } else {
                    Err("gain matrices must be finite".into())
                }
            }
        }
    }
}

impl Default for ControlLaw {
    fn default() -> Self {
        ControlLaw::ConfigRefs {
            decay_time: 0.2,
            damping_ratio: 1.0,
        }
    }
}
