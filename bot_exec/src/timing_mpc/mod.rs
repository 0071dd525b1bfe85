//! # Timing planner
//!
//! Turns the untimed waypoints of the current plan into a timed spline segment. The planner is
//! incremental: it tracks the `phase`, the index of the first waypoint not yet reached, and the
//! absolute arrival time of each remaining waypoint. Every cycle only the remaining tail is
//! re-timed from the splice time, so time that has already elapsed is never renegotiated.
//!
//! The actual timing problem is solved by a [`TimingOptimizer`]. [`BoundedTiming`] is the built in
//! implementation.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod bounded;
pub mod params;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::trace;
use nalgebra::DVector;
use serde::Serialize;

use crate::spline::SplineSegment;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use bounded::*;
pub use params::Params;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// Solver for the time parameterisation of a waypoint sequence.
pub trait TimingOptimizer: Send {
    /// Find segment durations and waypoint velocities for moving through `waypoints`, starting at
    /// `x0` with velocity `v0`.
    fn solve(
        &mut self,
        waypoints: &[DVector<f64>],
        x0: &DVector<f64>,
        v0: &DVector<f64>,
        bounds: &TimingBounds,
        costs: &TimingCosts,
    ) -> Result<Timing, TimingError>;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Per-joint kinematic bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingBounds {
    pub max_vel: DVector<f64>,
    pub max_acc: DVector<f64>,
    pub max_jerk: Option<DVector<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingCosts {
    /// Higher values give shorter motions
    pub time_cost: f64,

    /// Higher values give slower, smoother motions
    pub ctrl_cost: f64,
}

/// Result of a timing solve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timing {
    /// Duration of each segment, the first segment runs from the start state to waypoint 0
    pub durations: Vec<f64>,

    /// Velocity at each waypoint
    pub vels: Vec<DVector<f64>>,
}

/// Incremental timing planner.
pub struct TimingMpc {
    params: Params,
    optimizer: Box<dyn TimingOptimizer>,
    costs: TimingCosts,

    waypoints: Vec<DVector<f64>>,

    /// Index of the first waypoint not yet retired
    phase: usize,

    /// Absolute arrival time of each waypoint, only meaningful from `phase` on
    arrival_times: Vec<f64>,

    /// Velocity at each waypoint from the last solve
    vels: Vec<DVector<f64>>,

    /// True once the current tail has been timed
    timed: bool,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TimingError {
    #[error("No waypoints left to time")]
    EmptyPath,

    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("Invalid costs: time cost {time_cost}, control cost {ctrl_cost}")]
    InvalidCosts { time_cost: f64, ctrl_cost: f64 },

    #[error("Expected {expected} joints, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Durations did not satisfy the bounds after {0} iterations")]
    NoConvergence(usize),

    #[error("Got {durations} durations for {waypoints} remaining waypoints")]
    DurationsMismatch { durations: usize, waypoints: usize },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TimingBounds {
    /// Build bounds for `dof` joints from the parameters, broadcasting single values.
    pub fn from_params(params: &Params, dof: usize) -> Result<Self, TimingError> {
        let max_jerk = match params.max_jerk {
            Some(ref j) => Some(broadcast("max_jerk", j, dof)?),
            None => None,
        };

        let bounds = Self {
            max_vel: broadcast("max_vel", &params.max_vel, dof)?,
            max_acc: broadcast("max_acc", &params.max_acc, dof)?,
            max_jerk,
        };
        bounds.validate(dof)?;

        Ok(bounds)
    }

    /// Check that every bound is positive and has `dof` entries.
    pub fn validate(&self, dof: usize) -> Result<(), TimingError> {
        let named = [
            ("max_vel", Some(&self.max_vel)),
            ("max_acc", Some(&self.max_acc)),
            ("max_jerk", self.max_jerk.as_ref()),
        ];

        for (name, bound) in named.iter() {
            if let Some(b) = bound {
                if b.len() != dof {
                    return Err(TimingError::InvalidBounds(format!(
                        "{} has {} entries for {} joints",
                        name,
                        b.len(),
                        dof
                    )));
                }
                if b.iter().any(|v| *v <= 0.0 || !v.is_finite()) {
                    return Err(TimingError::InvalidBounds(format!(
                        "{} must be positive and finite",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}

impl TimingCosts {
    pub fn validate(&self) -> Result<(), TimingError> {
        if self.time_cost > 0.0 && self.ctrl_cost > 0.0 {
            Ok(())
        } else {
            Err(TimingError::InvalidCosts {
                time_cost: self.time_cost,
                ctrl_cost: self.ctrl_cost,
            })
        }
    }
}

impl TimingMpc {
    pub fn new(params: Params, optimizer: Box<dyn TimingOptimizer>) -> Self {
        let costs = TimingCosts {
            time_cost: params.time_cost,
            ctrl_cost: params.ctrl_cost,
        };

        Self {
            params,
            optimizer,
            costs,
            waypoints: Vec::new(),
            phase: 0,
            arrival_times: Vec::new(),
            vels: Vec::new(),
            timed: false,
        }
    }

    /// Timing planner using the built in [`BoundedTiming`] solver.
    pub fn with_bounded(params: Params) -> Self {
        let optimizer = BoundedTiming::from_params(&params);
        Self::new(params, Box::new(optimizer))
    }

    pub fn costs(&self) -> TimingCosts {
        self.costs
    }

    pub fn set_costs(&mut self, costs: TimingCosts) {
        self.costs = costs;
    }

    /// Replace the waypoints with those of a new plan, restarting from phase 0.
    pub fn set_waypoints(&mut self, waypoints: Vec<DVector<f64>>) {
        self.arrival_times = vec![0.0; waypoints.len()];
        self.vels = waypoints.iter().map(|w| DVector::zeros(w.len())).collect();
        self.waypoints = waypoints;
        self.phase = 0;
        self.timed = false;
    }

    pub fn waypoints(&self) -> &[DVector<f64>] {
        &self.waypoints
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    /// True if every waypoint has been retired.
    pub fn is_done(&self) -> bool {
        self.phase >= self.waypoints.len()
    }

    /// Waypoints that have not been retired yet.
    pub fn remaining(&self) -> &[DVector<f64>] {
        &self.waypoints[self.phase.min(self.waypoints.len())..]
    }

    /// Arrival times of the remaining waypoints, `None` until the tail has been timed.
    pub fn arrival_times(&self) -> Option<&[f64]> {
        if self.timed {
            Some(&self.arrival_times[self.phase.min(self.arrival_times.len())..])
        } else {
            None
        }
    }

    /// Retire waypoints whose arrival time is at or before `splice_time`.
    ///
    /// If `tracking_error` is above `precision` the next waypoint is kept as the target even if
    /// its arrival time has passed, so it gets re-timed from the current state. Returns the number
    /// of waypoints retired.
    pub fn retire(&mut self, splice_time: f64, tracking_error: f64, precision: f64) -> usize {
        if !self.timed {
            return 0;
        }

        let mut retired = 0;

        while self.phase < self.waypoints.len() && self.arrival_times[self.phase] <= splice_time {
            if tracking_error > precision {
                trace!(
                    "Keeping waypoint {} as target, tracking error {:.4} > {:.4}",
                    self.phase,
                    tracking_error,
                    precision
                );
                break;
            }
            self.phase += 1;
            retired += 1;
        }

        retired
    }

    /// Re-time the remaining waypoints starting from `x0`, `v0` at `start_time`.
    ///
    /// Returns the duration of each remaining segment.
    pub fn solve(
        &mut self,
        x0: &DVector<f64>,
        v0: &DVector<f64>,
        start_time: f64,
    ) -> Result<Vec<f64>, TimingError> {
        if self.is_done() {
            return Err(TimingError::EmptyPath);
        }

        let dof = x0.len();
        if v0.len() != dof {
            return Err(TimingError::DimensionMismatch {
                expected: dof,
                found: v0.len(),
            });
        }

        let bounds = TimingBounds::from_params(&self.params, dof)?;
        let timing = self.optimizer.solve(
            &self.waypoints[self.phase..],
            x0,
            v0,
            &bounds,
            &self.costs,
        )?;

        let remaining = self.waypoints.len() - self.phase;
        if timing.durations.len() != remaining || timing.vels.len() != remaining {
            return Err(TimingError::DurationsMismatch {
                durations: timing.durations.len(),
                waypoints: remaining,
            });
        }

        let mut t = start_time;
        for (i, (d, v)) in timing.durations.iter().zip(timing.vels.iter()).enumerate() {
            t += d;
            self.arrival_times[self.phase + i] = t;
            self.vels[self.phase + i] = v.clone();
        }
        self.timed = true;

        Ok(timing.durations)
    }

    /// Build the spline segment for the remaining waypoints from the given durations.
    pub fn as_spline(
        &self,
        durations: &[f64],
        start_time: f64,
    ) -> Result<SplineSegment, TimingError> {
        let points = self.remaining().to_vec();

        if durations.len() != points.len() {
            return Err(TimingError::DurationsMismatch {
                durations: durations.len(),
                waypoints: points.len(),
            });
        }

        let times = durations
            .iter()
            .scan(start_time, |t, d| {
                *t += d;
                Some(*t)
            })
            .collect();

        Ok(SplineSegment {
            points,
            vels: self.vels[self.phase..].to_vec(),
            times,
        })
    }

    /// Total time left until the last waypoint, measured from `time`.
    pub fn time_to_go(&self, time: f64) -> Option<f64> {
        match (self.timed, self.arrival_times.last()) {
            (true, Some(end)) if !self.is_done() => Some((end - time).max(0.0)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn broadcast(name: &str, values: &[f64], dof: usize) -> Result<DVector<f64>, TimingError> {
    match values.len() {
        1 => Ok(DVector::from_element(dof, values[0])),
        n if n == dof => Ok(DVector::from_column_slice(values)),
        n => Err(TimingError::InvalidBounds(format!(
            "{} has {} entries for {} joints",
            name, n, dof
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dv(v: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(v)
    }

    fn planner() -> TimingMpc {
        let mut t = TimingMpc::with_bounded(Params::default());
        t.set_waypoints(vec![dv(&[0.5, 0.0]), dv(&[1.0, 0.5]), dv(&[1.0, 1.0])]);
        t
    }

    #[test]
    fn test_solve_and_as_spline() {
        let mut t = planner();
        let x0 = dv(&[0.0, 0.0]);
        let v0 = dv(&[0.0, 0.0]);

        let durations = t.solve(&x0, &v0, 10.0).unwrap();
        assert_eq!(durations.len(), 3);
        assert!(durations.iter().all(|d| *d > 0.0));

        let seg = t.as_spline(&durations, 10.0).unwrap();
        assert_eq!(seg.len(), 3);
        assert_eq!(seg.points[2], dv(&[1.0, 1.0]));
        assert_eq!(seg.vels[2], dv(&[0.0, 0.0]));
        assert!((seg.times[2] - (10.0 + durations.iter().sum::<f64>())).abs() < 1e-12);
        assert_eq!(t.arrival_times().unwrap(), &seg.times[..]);
    }

    #[test]
    fn test_retire_and_backtrack() {
        let mut t = planner();
        let x0 = dv(&[0.0, 0.0]);
        t.solve(&x0, &x0, 0.0).unwrap();
        let first_arrival = t.arrival_times().unwrap()[0];

        // Large tracking error keeps the waypoint as the target
        assert_eq!(t.retire(first_arrival + 1e-3, 1.0, 0.1), 0);
        assert_eq!(t.phase(), 0);

        assert_eq!(t.retire(first_arrival + 1e-3, 0.01, 0.1), 1);
        assert_eq!(t.phase(), 1);
        assert_eq!(t.remaining().len(), 2);

        // Re-timing only covers the tail, from the given start
        let d = t.solve(&dv(&[0.5, 0.0]), &dv(&[0.0, 0.0]), 5.0).unwrap();
        assert_eq!(d.len(), 2);
        assert!(t.arrival_times().unwrap()[0] > 5.0);

        // Retire everything
        assert_eq!(t.retire(1e6, 0.0, 0.1), 2);
        assert!(t.is_done());
        assert!(matches!(
            t.solve(&x0, &x0, 0.0),
            Err(TimingError::EmptyPath)
        ));
    }

    #[test]
    fn test_bounds_from_params() {
        let mut p = Params::default();
        p.max_vel = vec![1.0, 2.0, 3.0];
        assert!(TimingBounds::from_params(&p, 3).is_ok());
        assert!(matches!(
            TimingBounds::from_params(&p, 2),
            Err(TimingError::InvalidBounds(_))
        ));

        p.max_vel = vec![0.0];
        assert!(matches!(
            TimingBounds::from_params(&p, 2),
            Err(TimingError::InvalidBounds(_))
        ));
    }
}
