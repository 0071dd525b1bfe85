//! # Cubic spline
//!
//! Piecewise cubic Hermite interpolation over joint space. Each knot carries a time, a position
//! and a velocity, and each segment is the unique cubic matching position and velocity at both of
//! its knots. This makes splitting a segment exact: the restriction of a cubic to a sub-interval is
//! the Hermite cubic through its own end values, which is what smooth override relies on.
//!
//! ```text
//! p(s) = h00(s) p0 + h10(s) dt v0 + h01(s) p1 + h11(s) dt v1,   s = (t - t0) / dt
//! ```

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Two knot times closer than this are considered the same time.
pub const TIME_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A single control point of the spline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knot {
    pub time: f64,
    pub pos: DVector<f64>,
    pub vel: DVector<f64>,
}

/// Ordered control points to be written into the reference buffer.
///
/// Times are absolute control times and strictly increasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplineSegment {
    pub points: Vec<DVector<f64>>,
    pub vels: Vec<DVector<f64>>,
    pub times: Vec<f64>,
}

/// An evaluable piecewise cubic reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubicSpline {
    knots: Vec<Knot>,
}

/// Position, velocity and acceleration of the spline at a given time.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineSample {
    pub pos: DVector<f64>,
    pub vel: DVector<f64>,
    pub acc: DVector<f64>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SplineError {
    #[error("A spline needs at least one knot")]
    Empty,

    #[error("Knot times must be strictly increasing, knot {index} at {time} s is not")]
    NonIncreasingTimes { index: usize, time: f64 },

    #[error("Knot {index} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("Got {points} points, {vels} velocities and {times} times")]
    LengthMismatch {
        points: usize,
        vels: usize,
        times: usize,
    },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Knot {
    pub fn new(time: f64, pos: DVector<f64>, vel: DVector<f64>) -> Self {
        Self { time, pos, vel }
    }

    pub fn at_rest(time: f64, pos: DVector<f64>) -> Self {
        let vel = DVector::zeros(pos.len());
        Self { time, pos, vel }
    }
}

impl SplineSegment {
    pub fn new(
        points: Vec<DVector<f64>>,
        vels: Vec<DVector<f64>>,
        times: Vec<f64>,
    ) -> Result<Self, SplineError> {
        if points.len() != vels.len() || points.len() != times.len() {
            return Err(SplineError::LengthMismatch {
                points: points.len(),
                vels: vels.len(),
                times: times.len(),
            });
        }

        Ok(Self {
            points,
            vels,
            times,
        })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn end_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Convert into knots, checking the lengths agree.
    pub fn into_knots(self) -> Result<Vec<Knot>, SplineError> {
        if self.points.len() != self.vels.len() || self.points.len() != self.times.len() {
            return Err(SplineError::LengthMismatch {
                points: self.points.len(),
                vels: self.vels.len(),
                times: self.times.len(),
            });
        }

        Ok(self
            .times
            .into_iter()
            .zip(self.points.into_iter().zip(self.vels.into_iter()))
            .map(|(time, (pos, vel))| Knot { time, pos, vel })
            .collect())
    }
}

impl CubicSpline {
    /// Build a spline from knots, validating times and dimensions.
    pub fn new(knots: Vec<Knot>) -> Result<Self, SplineError> {
        validate_knots(&knots)?;
        Ok(Self { knots })
    }

    /// A spline that holds a single configuration forever.
    pub fn hold(pos: DVector<f64>, time: f64) -> Self {
        Self {
            knots: vec![Knot::at_rest(time, pos)],
        }
    }

    pub fn knots(&self) -> &[Knot] {
        &self.knots
    }

    pub fn dof(&self) -> usize {
        self.knots[0].pos.len()
    }

    pub fn begin_time(&self) -> f64 {
        self.knots[0].time
    }

    pub fn end_time(&self) -> f64 {
        self.knots[self.knots.len() - 1].time
    }

    /// Evaluate the spline at the given time.
    ///
    /// Before the first knot the first position is held, after the last knot the last position
    /// is held, both with zero velocity and acceleration.
    pub fn eval(&self, t: f64) -> SplineSample {
        let n = self.knots.len();
        let first = &self.knots[0];
        let last = &self.knots[n - 1];

        if n == 1 || t <= first.time || t >= last.time {
            let k = if t <= first.time { first } else { last };

            // Exactly at an end knot the knot's own velocity is reported, outside it the spline holds
            let vel = if n > 1 && (t - k.time).abs() <= TIME_EPSILON {
                k.vel.clone()
            } else {
                DVector::zeros(k.pos.len())
            };

            return SplineSample {
                pos: k.pos.clone(),
                vel,
                acc: DVector::zeros(k.pos.len()),
            };
        }

        // Index of the first knot strictly after t, guaranteed to be in 1..n
        let i = self.knots.partition_point(|k| k.time <= t);
        hermite(&self.knots[i - 1], &self.knots[i], t)
    }

    /// Position only, cheaper to read in tests and reports.
    pub fn eval_pos(&self, t: f64) -> DVector<f64> {
        self.eval(t).pos
    }

    /// Build a new spline that is identical to this one up to `from_time` and then follows
    /// `new_knots`.
    ///
    /// A knot is synthesised at `from_time` from this spline's own interpolation, so position and
    /// velocity are continuous there. Knots older than `history_s` before `from_time` are pruned,
    /// keeping the one knot needed to evaluate the start of the retained window.
    pub fn splice(
        &self,
        from_time: f64,
        new_knots: Vec<Knot>,
        history_s: f64,
    ) -> Result<Self, SplineError> {
        let sample = self.eval(from_time);

        // Retain past knots strictly before the splice point
        let keep_from = self
            .knots
            .iter()
            .rposition(|k| k.time < from_time - history_s)
            .unwrap_or(0);

        let mut knots: Vec<Knot> = self.knots[keep_from..]
            .iter()
            .take_while(|k| k.time < from_time - TIME_EPSILON)
            .cloned()
            .collect();

        knots.push(Knot::new(from_time, sample.pos, sample.vel));
        knots.extend(new_knots);

        Self::new(knots)
    }

    /// Append knots after the current end of the spline.
    pub fn extended(&self, new_knots: Vec<Knot>) -> Result<Self, SplineError> {
        let mut knots = self.knots.clone();
        knots.extend(new_knots);
        Self::new(knots)
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Estimate knot velocities for a sequence of timed points.
///
/// Each interior velocity is the mean of the incoming and outgoing slopes per joint, or zero
/// where the joint reverses direction so the interpolant does not overshoot a waypoint. The final
/// velocity is zero. `start` is the (time, position) the first point is reached from.
pub fn knot_velocities(
    start: (f64, &DVector<f64>),
    points: &[DVector<f64>],
    times: &[f64],
) -> Vec<DVector<f64>> {
    let n = points.len();
    let mut vels = Vec::with_capacity(n);

    for i in 0..n {
        if i + 1 == n {
            vels.push(DVector::zeros(points[i].len()));
            break;
        }

        let (t_prev, p_prev) = if i == 0 {
            start
        } else {
            (times[i - 1], &points[i - 1])
        };

        let slope_in = (&points[i] - p_prev) / (times[i] - t_prev);
        let slope_out = (&points[i + 1] - &points[i]) / (times[i + 1] - times[i]);

        vels.push(slope_in.zip_map(&slope_out, |a, b| {
            if a * b > 0.0 {
                0.5 * (a + b)
            } else {
                0.0
            }
        }));
    }

    vels
}

/// Evaluate the Hermite cubic between two knots at time `t`.
pub fn hermite(k0: &Knot, k1: &Knot, t: f64) -> SplineSample {
    let dt = k1.time - k0.time;
    let s = (t - k0.time) / dt;
    let s2 = s * s;
    let s3 = s2 * s;

    // Basis functions
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;

    // First derivatives with respect to s
    let d00 = 6.0 * s2 - 6.0 * s;
    let d10 = 3.0 * s2 - 4.0 * s + 1.0;
    let d01 = -6.0 * s2 + 6.0 * s;
    let d11 = 3.0 * s2 - 2.0 * s;

    // Second derivatives with respect to s
    let dd00 = 12.0 * s - 6.0;
    let dd10 = 6.0 * s - 4.0;
    let dd01 = -12.0 * s + 6.0;
    let dd11 = 6.0 * s - 2.0;

    let pos = &k0.pos * h00 + &k0.vel * (dt * h10) + &k1.pos * h01 + &k1.vel * (dt * h11);
    let vel = (&k0.pos * d00 + &k0.vel * (dt * d10) + &k1.pos * d01 + &k1.vel * (dt * d11)) / dt;
    let acc = (&k0.pos * dd00 + &k0.vel * (dt * dd10) + &k1.pos * dd01 + &k1.vel * (dt * dd11))
        / (dt * dt);

    SplineSample { pos, vel, acc }
}

/// Third time derivative of the Hermite cubic between two knots, constant over the segment.
pub fn hermite_jerk(k0: &Knot, k1: &Knot) -> DVector<f64> {
    let dt = k1.time - k0.time;
    ((&k0.pos - &k1.pos) * 12.0 + (&k0.vel + &k1.vel) * (6.0 * dt)) / (dt * dt * dt)
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn validate_knots(knots: &[Knot]) -> Result<(), SplineError> {
    let first = knots.first().ok_or(SplineError::Empty)?;
    let dof = first.pos.len();

    for (index, k) in knots.iter().enumerate() {
        if k.pos.len() != dof || k.vel.len() != dof {
            return Err(SplineError::DimensionMismatch {
                index,
                expected: dof,
                found: if k.pos.len() != dof {
                    k.pos.len()
                } else {
                    k.vel.len()
                },
            });
        }

        if !k.time.is_finite() {
            return Err(SplineError::NonIncreasingTimes {
                index,
                time: k.time,
            });
        }

        if index > 0 && k.time <= knots[index - 1].time + TIME_EPSILON {
            return Err(SplineError::NonIncreasingTimes {
                index,
                time: k.time,
            });
        }
    }

    Ok(())
}
