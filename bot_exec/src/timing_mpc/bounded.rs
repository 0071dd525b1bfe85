//! Bounded timing solver
//!
//! Initial durations come from the closed form leap duration, the time a critically timed cubic
//! leap of length `d` takes when starting with velocity `v` along it:
//!
//! ```text
//! T = (sqrt(6 c d + v^2) - v) / c
//! ```
//!
//! where `c` is the time cost. This is scaled by the cube root of the control cost. Each segment
//! is then sampled and any segment breaking a velocity, acceleration or jerk bound is lengthened
//! until all bounds hold.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::DVector;

use super::{Params, Timing, TimingBounds, TimingCosts, TimingError, TimingOptimizer};
use crate::spline::{hermite, hermite_jerk, knot_velocities, Knot};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Segments shorter than this are given the minimum duration.
const MIN_DISTANCE: f64 = 1e-6;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BoundedTiming {
    pub min_segment_s: f64,
    pub growth_factor: f64,
    pub max_iters: usize,
    pub samples_per_segment: usize,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl BoundedTiming {
    pub fn from_params(params: &Params) -> Self {
        Self {
            min_segment_s: params.min_segment_s,
            growth_factor: params.growth_factor,
            max_iters: params.max_iters,
            samples_per_segment: params.samples_per_segment,
        }
    }

    /// Largest ratio of any sampled quantity to its bound over the segment.
    ///
    /// The start of the segment is not sampled since it is either the given initial state or the
    /// end of the previous segment.
    fn segment_ratio(&self, k0: &Knot, k1: &Knot, bounds: &TimingBounds) -> f64 {
        let dt = k1.time - k0.time;
        let n = self.samples_per_segment.max(1);
        let mut ratio: f64 = 0.0;

        for i in 1..=n {
            let t = k0.time + dt * (i as f64) / (n as f64);
            let s = hermite(k0, k1, t);
            ratio = ratio
                .max(max_ratio(&s.vel, &bounds.max_vel))
                .max(max_ratio(&s.acc, &bounds.max_acc));
        }

        // Acceleration is linear over the segment, so the start is its other extreme
        let start = hermite(k0, k1, k0.time);
        ratio = ratio.max(max_ratio(&start.acc, &bounds.max_acc));

        if let Some(ref max_jerk) = bounds.max_jerk {
            ratio = ratio.max(max_ratio(&hermite_jerk(k0, k1), max_jerk));
        }

        ratio
    }
}

impl Default for BoundedTiming {
    fn default() -> Self {
        Self::from_params(&Params::default())
    }
}

impl TimingOptimizer for BoundedTiming {
    fn solve(
        &mut self,
        waypoints: &[DVector<f64>],
        x0: &DVector<f64>,
        v0: &DVector<f64>,
        bounds: &TimingBounds,
        costs: &TimingCosts,
    ) -> Result<Timing, TimingError> {
        if waypoints.is_empty() {
            return Err(TimingError::EmptyPath);
        }

        let dof = x0.len();
        if let Some(w) = waypoints.iter().find(|w| w.len() != dof) {
            return Err(TimingError::DimensionMismatch {
                expected: dof,
                found: w.len(),
            });
        }
        bounds.validate(dof)?;
        costs.validate()?;

        if self.growth_factor <= 1.0 || self.growth_factor.is_nan() {
            return Err(TimingError::InvalidBounds(format!(
                "growth factor must be above 1, got {}",
                self.growth_factor
            )));
        }

        // ---- INITIAL GUESS ----

        let scale = costs.ctrl_cost.cbrt();
        let mut durations = Vec::with_capacity(waypoints.len());
        let mut prev = x0;

        for (i, w) in waypoints.iter().enumerate() {
            let delta = w - prev;
            let d = delta.norm();

            let t = if d < MIN_DISTANCE {
                self.min_segment_s
            } else {
                // Only the first segment starts with a known velocity
                let v = if i == 0 { v0.dot(&delta) / d } else { 0.0 };
                leap_duration(d, v, costs.time_cost) * scale
            };

            durations.push(t.max(self.min_segment_s));
            prev = w;
        }

        // ---- BOUND ENFORCEMENT ----

        for _ in 0..self.max_iters {
            let times: Vec<f64> = durations
                .iter()
                .scan(0.0, |t, d| {
                    *t += d;
                    Some(*t)
                })
                .collect();
            let vels = knot_velocities((0.0, x0), waypoints, &times);

            let mut satisfied = true;
            let mut k0 = Knot::new(0.0, x0.clone(), v0.clone());

            for i in 0..waypoints.len() {
                let k1 = Knot::new(times[i], waypoints[i].clone(), vels[i].clone());

                if self.segment_ratio(&k0, &k1, bounds) > 1.0 {
                    durations[i] *= self.growth_factor;
                    satisfied = false;
                }

                k0 = k1;
            }

            if satisfied {
                return Ok(Timing { durations, vels });
            }
        }

        Err(TimingError::NoConvergence(self.max_iters))
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Duration of a single leap of length `dist` starting with velocity `vel` along it.
pub fn leap_duration(dist: f64, vel: f64, time_cost: f64) -> f64 {
    ((6.0 * time_cost * dist + vel * vel).sqrt() - vel) / time_cost
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn max_ratio(values: &DVector<f64>, bounds: &DVector<f64>) -> f64 {
    values
        .iter()
        .zip(bounds.iter())
        .map(|(v, b)| v.abs() / b)
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spline::CubicSpline;

    fn dv(v: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(v)
    }

    fn bounds(vel: f64, acc: f64, jerk: Option<f64>) -> TimingBounds {
        TimingBounds {
            max_vel: DVector::from_element(2, vel),
            max_acc: DVector::from_element(2, acc),
            max_jerk: jerk.map(|j| DVector::from_element(2, j)),
        }
    }

    const COSTS: TimingCosts = TimingCosts {
        time_cost: 1.0,
        ctrl_cost: 1.0,
    };

    #[test]
    fn test_leap_duration() {
        // At rest, T = sqrt(6 d / c)
        assert!((leap_duration(1.0, 0.0, 1.0) - 6f64.sqrt()).abs() < 1e-12);

        // Already moving towards the target shortens the leap
        assert!(leap_duration(1.0, 0.5, 1.0) < leap_duration(1.0, 0.0, 1.0));

        // Higher time cost is shorter
        assert!(leap_duration(1.0, 0.0, 10.0) < leap_duration(1.0, 0.0, 1.0));
    }

    #[test]
    fn test_respects_bounds() {
        let waypoints = vec![dv(&[1.0, 0.0]), dv(&[2.0, 1.0]), dv(&[2.0, 3.0])];
        let x0 = dv(&[0.0, 0.0]);
        let v0 = dv(&[0.0, 0.0]);
        let b = bounds(0.5, 1.0, Some(5.0));

        let mut solver = BoundedTiming::default();
        let timing = solver.solve(&waypoints, &x0, &v0, &b, &COSTS).unwrap();

        // Rebuild the spline and check the bounds on a fine grid, with a little slack for
        // sampling
        let mut knots = vec![Knot::new(0.0, x0, v0)];
        let mut t = 0.0;
        for i in 0..3 {
            t += timing.durations[i];
            knots.push(Knot::new(t, waypoints[i].clone(), timing.vels[i].clone()));
        }
        let spline = CubicSpline::new(knots).unwrap();

        let steps = 2000;
        for i in 0..=steps {
            let s = spline.eval(t * i as f64 / steps as f64);
            assert!(s.vel.amax() <= 0.5 * 1.05, "velocity {} at step {}", s.vel.amax(), i);
            assert!(s.acc.amax() <= 1.0 * 1.05, "acceleration {} at step {}", s.acc.amax(), i);
        }

        assert_eq!(timing.vels[2], dv(&[0.0, 0.0]));
    }

    #[test]
    fn test_ctrl_cost_slows_down() {
        let waypoints = vec![dv(&[0.1, 0.1])];
        let x0 = dv(&[0.0, 0.0]);
        let b = bounds(100.0, 100.0, None);
        let mut solver = BoundedTiming::default();

        let fast = solver.solve(&waypoints, &x0, &x0, &b, &COSTS).unwrap();
        let slow = solver
            .solve(
                &waypoints,
                &x0,
                &x0,
                &b,
                &TimingCosts {
                    time_cost: 1.0,
                    ctrl_cost: 8.0,
                },
            )
            .unwrap();

        assert!((slow.durations[0] / fast.durations[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_input() {
        let mut solver = BoundedTiming::default();
        let x0 = dv(&[0.0, 0.0]);
        let b = bounds(1.0, 1.0, None);

        assert!(matches!(
            solver.solve(&[], &x0, &x0, &b, &COSTS),
            Err(TimingError::EmptyPath)
        ));
        assert!(matches!(
            solver.solve(&[dv(&[1.0])], &x0, &x0, &b, &COSTS),
            Err(TimingError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            solver.solve(&[dv(&[1.0, 1.0])], &x0, &x0, &bounds(-1.0, 1.0, None), &COSTS),
            Err(TimingError::InvalidBounds(_))
        ));

        // A tiny iteration budget can't reach very tight bounds
        solver.max_iters = 2;
        assert!(matches!(
            solver.solve(&[dv(&[10.0, 10.0])], &x0, &x0, &bounds(1e-3, 1e-3, None), &COSTS),
            Err(TimingError::NoConvergence(2))
        ));
    }
}
