//! Shared reference buffer

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};

use log::{debug, trace};
use nalgebra::DVector;

use super::*;
use crate::spline::{knot_velocities, CubicSpline, Knot, SplineError, SplineSegment, TIME_EPSILON};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Amount of spline history kept before the splice time on every override.
///
/// Units: seconds
pub const DEFAULT_HISTORY_S: f64 = 2.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// An immutable, fully constructed state of the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RefSnapshot {
    /// Incremented on every write
    pub version: u64,

    pub reference: Reference,

    pub law: ControlLaw,
}

/// The reference buffer shared between the servo loop and the planning side.
#[derive(Debug)]
pub struct RefBuffer {
    current: RwLock<Arc<RefSnapshot>>,

    /// Serialises writers so that read-modify-write sequences don't interleave
    writer: Mutex<()>,

    /// Latest control time the servo sampled the reference at, as `f64` bits
    read_time: AtomicU64,

    history_s: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RefBufError {
    #[error("Cannot write at {from_time} s, the reference horizon starts at {horizon_start} s")]
    Causality { from_time: f64, horizon_start: f64 },

    #[error("Cannot write at {from_time} s, the reference was already read at {read_time} s")]
    AlreadyRead { from_time: f64, read_time: f64 },

    #[error("Invalid control law: {0}")]
    InvalidLaw(String),

    #[error("The buffer is in hold mode, switch to motion before appending or overriding")]
    HoldMode,

    #[error("Attempted to write an empty path")]
    EmptyPath,

    #[error("Expected {expected} times for the path, found {found}")]
    TimesMismatch { expected: usize, found: usize },

    #[error("Invalid spline: {0}")]
    Spline(#[from] SplineError),

    #[error("Reference buffer lock is poisoned")]
    PoisonError,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl RefBuffer {
    pub fn new(reference: Reference, law: ControlLaw) -> Self {
        Self {
            current: RwLock::new(Arc::new(RefSnapshot {
                version: 0,
                reference,
                law,
            })),
            writer: Mutex::new(()),
            read_time: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
            history_s: DEFAULT_HISTORY_S,
        }
    }

    /// Start in motion mode holding `q` from `time`.
    pub fn at_rest(q: DVector<f64>, time: f64, law: ControlLaw) -> Self {
        Self::new(Reference::Motion(CubicSpline::hold(q, time)), law)
    }

    /// Set how much spline history is kept before a splice.
    pub fn with_history(mut self, history_s: f64) -> Self {
        self.history_s = history_s;
        self
    }

    /// Get the current snapshot.
    ///
    /// The lock is only held for the duration of the `Arc` clone.
    pub fn snapshot(&self) -> Result<Arc<RefSnapshot>, RefBufError> {
        Ok(self.current.read()?.clone())
    }

    /// Get the current snapshot for use at `ctrl_time`.
    ///
    /// The read time is recorded while the read lock is held, after which no write may change
    /// the reference at or before it.
    pub fn read_at(&self, ctrl_time: f64) -> Result<Arc<RefSnapshot>, RefBufError> {
        let current = self.current.read()?;

        // Keep the latest time, `None` leaves it unchanged
        let _ = self
            .read_time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if ctrl_time > f64::from_bits(bits) {
                    Some(ctrl_time.to_bits())
                } else {
                    None
                }
            });

        Ok(current.clone())
    }

    /// Latest control time the reference was read at, `None` if it never was.
    pub fn read_time(&self) -> Option<f64> {
        let t = f64::from_bits(self.read_time.load(Ordering::Acquire));
        if t.is_finite() {
            Some(t)
        } else {
            None
        }
    }

    pub fn version(&self) -> Result<u64, RefBufError> {
        Ok(self.snapshot()?.version)
    }

    /// Reference values at `ctrl_time`, given the measured state.
    ///
    /// Counts as a read at `ctrl_time`, see [`RefBuffer::read_at`].
    pub fn get_reference(
        &self,
        q_real: &DVector<f64>,
        q_dot_real: &DVector<f64>,
        ctrl_time: f64,
    ) -> Result<RefSample, RefBufError> {
        Ok(self.read_at(ctrl_time)?.reference.sample(q_real, q_dot_real, ctrl_time))
    }

    /// Start time of the motion horizon, `None` in hold mode.
    pub fn horizon_start(&self) -> Result<Option<f64>, RefBufError> {
        Ok(self.snapshot()?.reference.spline().map(|s| s.begin_time()))
    }

    /// End time of the motion reference, `None` in hold mode.
    pub fn end_time(&self) -> Result<Option<f64>, RefBufError> {
        Ok(self.snapshot()?.reference.spline().map(|s| s.end_time()))
    }

    /// Extend the spline with new points after `max(end, from_time)`.
    ///
    /// If `relative` is set `times` are offsets from that start, otherwise they are absolute
    /// control times. Velocities at the new knots are estimated from neighbouring slopes, with
    /// the final knot at rest.
    pub fn append(
        &self,
        points: &[DVector<f64>],
        times: &[f64],
        from_time: f64,
        relative: bool,
    ) -> Result<u64, RefBufError> {
        if points.is_empty() {
            return Err(RefBufError::EmptyPath);
        }
        if points.len() != times.len() {
            return Err(RefBufError::TimesMismatch {
                expected: points.len(),
                found: times.len(),
            });
        }

        self.write(|current| {
            let spline = motion_spline(&current.reference)?;
            check_causality(spline, from_time)?;

            let end = spline.knots()[spline.knots().len() - 1].clone();
            let start = end.time.max(from_time);

            let abs_times: Vec<f64> = if relative {
                times.iter().map(|t| start + t).collect()
            } else {
                times.to_vec()
            };

            let vels = knot_velocities((start, &end.pos), points, &abs_times);

            let mut knots = Vec::with_capacity(points.len() + 1);

            // Idle at the old end position until the new segment begins
            if start > end.time + TIME_EPSILON {
                knots.push(Knot::at_rest(start, end.pos.clone()));
            }

            knots.extend(
                abs_times
                    .into_iter()
                    .zip(points.iter().cloned().zip(vels.into_iter()))
                    .map(|(time, (pos, vel))| Knot::new(time, pos, vel)),
            );

            let reference = Reference::Motion(spline.extended(knots)?);
            Ok((reference, current.law.clone(), Some(start)))
        })
    }

    /// Replace everything after `from_time` with the given points, velocities and absolute times.
    ///
    /// A knot is inserted at `from_time` with the current spline's position and velocity there,
    /// so the reference up to and including `from_time` is unchanged.
    pub fn override_smooth(
        &self,
        points: &[DVector<f64>],
        vels: &[DVector<f64>],
        times: &[f64],
        from_time: f64,
    ) -> Result<u64, RefBufError> {
        if points.is_empty() {
            return Err(RefBufError::EmptyPath);
        }

        let knots = SplineSegment::new(points.to_vec(), vels.to_vec(), times.to_vec())?
            .into_knots()?;

        self.write(|current| {
            let spline = motion_spline(&current.reference)?;
            check_causality(spline, from_time)?;

            let reference = Reference::Motion(spline.splice(from_time, knots, self.history_s)?);
            Ok((reference, current.law.clone(), Some(from_time)))
        })
    }

    /// Override with a segment produced by the timing planner.
    pub fn override_segment(
        &self,
        segment: &SplineSegment,
        from_time: f64,
    ) -> Result<u64, RefBufError> {
        self.override_smooth(&segment.points, &segment.vels, &segment.times, from_time)
    }

    /// Switch to motion mode with the given spline.
    pub fn set_motion(&self, spline: CubicSpline) -> Result<u64, RefBufError> {
        self.write(|current| Ok((Reference::Motion(spline), current.law.clone(), None)))
    }

    /// Switch to hold mode.
    pub fn set_hold(&self, hold: HoldReference) -> Result<u64, RefBufError> {
        self.write(|current| Ok((Reference::Hold(hold), current.law.clone(), None)))
    }

    /// Hold the measured position, or float if `floating` is set.
    ///
    /// When floating, `damping` selects a zero velocity reference over passing the measured
    /// velocity through.
    pub fn hold(
        &self,
        floating: bool,
        damping: bool,
        q_measured: &DVector<f64>,
    ) -> Result<u64, RefBufError> {
        let hold = if floating {
            HoldReference::floating(damping)
        } else {
            HoldReference::at(q_measured.clone())
        };

        self.set_hold(hold)
    }

    /// Leave hold mode for a motion reference resting at the held position.
    ///
    /// Returns the new version, or `None` if the buffer was already in motion mode.
    pub fn ensure_motion(
        &self,
        q_measured: &DVector<f64>,
        time: f64,
    ) -> Result<Option<u64>, RefBufError> {
        if !self.snapshot()?.reference.is_hold() {
            return Ok(None);
        }

        let zeros = DVector::zeros(q_measured.len());
        self.write(|current| {
            let reference = match current.reference {
                Reference::Hold(_) => {
                    let pos = current.reference.sample(q_measured, &zeros, time).q;
                    Reference::Motion(CubicSpline::hold(pos, time))
                }
                // Another writer got there first
                Reference::Motion(_) => current.reference.clone(),
            };
            Ok((reference, current.law.clone(), None))
        })
        .map(Some)
    }

    /// Store the control law the servo applies with the reference.
    pub fn set_control_law(&self, law: ControlLaw) -> Result<u64, RefBufError> {
        law.validate().map_err(RefBufError::InvalidLaw)?;
        self.write(|current| Ok((current.reference.clone(), law, None)))
    }

    /// Build a new snapshot from the current one and swap it in.
    ///
    /// The builder also returns the time up to which the new reference matches the old one, if
    /// it changes the motion. The swap is refused if the servo has read past that time. The
    /// builder runs without holding the read/write lock, which is only taken for the swap.
    fn write<F>(&self, build: F) -> Result<u64, RefBufError>
    where
        F: FnOnce(&RefSnapshot) -> Result<(Reference, ControlLaw, Option<f64>), RefBufError>,
    {
        let _writer = self.writer.lock()?;

        let current = self.snapshot()?;
        let (reference, law, unchanged_until) = build(&current)?;

        let version = current.version + 1;
        let next = Arc::new(RefSnapshot {
            version,
            reference,
            law,
        });

        {
            // Readers record their time under the read lock, so none can slip past this check
            let mut slot = self.current.write()?;
            if let Some(from_time) = unchanged_until {
                let read_time = f64::from_bits(self.read_time.load(Ordering::Acquire));
                if from_time < read_time - TIME_EPSILON {
                    return Err(RefBufError::AlreadyRead {
                        from_time,
                        read_time,
                    });
                }
            }
            *slot = next;
        }

        match spline_end(&current.reference) {
            Some(end) => trace!("Reference v{} written (previous end {:.3} s)", version, end),
            None => debug!("Reference v{} written (previously holding)", version),
        }

        Ok(version)
    }
}

impl RefBufError {
    /// True for writes refused because they start too early, which a later write may avoid.
    pub fn is_causality(&self) -> bool {
        matches!(self, Self::Causality { .. } | Self::AlreadyRead { .. })
    }
}

impl<G> From<PoisonError<G>> for RefBufError {
    fn from(_: PoisonError<G>) -> Self {
        Self::PoisonError
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn motion_spline(reference: &Reference) -> Result<&CubicSpline, RefBufError> {
    reference.spline().ok_or(RefBufError::HoldMode)
}

fn check_causality(spline: &CubicSpline, from_time: f64) -> Result<(), RefBufError> {
    if from_time < spline.begin_time() - TIME_EPSILON {
        Err(RefBufError::Causality {
            from_time,
            horizon_start: spline.begin_time(),
        })
    } else {
        Ok(())
    }
}

fn spline_end(previous: &Reference) -> Option<f64> {
    previous.spline().map(|s| s.end_time())
}

#[cfg(test)]
mod test {
    use super::*;

    fn dv(v: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(v)
    }

    fn zero() -> DVector<f64> {
        dv(&[0.0, 0.0])
    }

    #[test]
    fn test_append_relative() {
        let buf = RefBuffer::at_rest(zero(), 0.0, ControlLaw::default());

        let v = buf
            .append(&[dv(&[1.0, 0.0]), dv(&[2.0, 1.0])], &[1.0, 2.0], 0.5, true)
            .unwrap();
        assert_eq!(v, 1);

        // The path starts at from_time since the old spline ended before it
        let snap = buf.snapshot().unwrap();
        let spline = snap.reference.spline().unwrap();
        assert_eq!(spline.knots().len(), 4);
        assert!((spline.end_time() - 2.5).abs() < 1e-12);
        assert_eq!(spline.eval_pos(0.5), zero());
        assert_eq!(spline.eval_pos(2.5), dv(&[2.0, 1.0]));

        // Appending again starts from the current end
        buf.append(&[dv(&[3.0, 1.0])], &[1.0], 0.0, true).unwrap();
        assert!((buf.end_time().unwrap().unwrap() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_append_errors() {
        let buf = RefBuffer::at_rest(zero(), 1.0, ControlLaw::default());

        assert!(matches!(
            buf.append(&[dv(&[1.0, 0.0])], &[1.0], 0.5, true),
            Err(RefBufError::Causality { .. })
        ));
        assert!(matches!(
            buf.append(
                &[dv(&[1.0, 0.0]), dv(&[2.0, 0.0])],
                &[2.0, 2.0],
                1.0,
                false
            ),
            Err(RefBufError::Spline(SplineError::NonIncreasingTimes { .. }))
        ));
        assert!(matches!(
            buf.append(&[], &[], 1.0, true),
            Err(RefBufError::EmptyPath)
        ));

        buf.hold(false, true, &zero()).unwrap();
        assert!(matches!(
            buf.append(&[dv(&[1.0, 0.0])], &[1.0], 1.0, true),
            Err(RefBufError::HoldMode)
        ));

        // Failed writes don't bump the version
        assert_eq!(buf.version().unwrap(), 1);
    }

    #[test]
    fn test_override_keeps_past() {
        let buf = RefBuffer::at_rest(zero(), 0.0, ControlLaw::default());
        buf.append(&[dv(&[1.0, 1.0])], &[2.0], 0.0, true).unwrap();

        let before = buf.snapshot().unwrap();
        let old = before.reference.spline().unwrap();

        buf.override_smooth(
            &[dv(&[-1.0, 0.5])],
            &[zero()],
            &[2.0],
            0.8,
        )
        .unwrap();

        let after = buf.snapshot().unwrap();
        let new = after.reference.spline().unwrap();

        for i in 0..=80 {
            let t = i as f64 * 0.01;
            let a = old.eval(t);
            let b = new.eval(t);
            assert!((a.pos - b.pos).norm() < 1e-9, "position differs at {}", t);
            assert!((a.vel - b.vel).norm() < 1e-9, "velocity differs at {}", t);
        }

        assert_eq!(new.eval_pos(2.0), dv(&[-1.0, 0.5]));
        assert_eq!(after.version, before.version + 1);
    }

    #[test]
    fn test_write_before_read_time_is_refused() {
        let buf = RefBuffer::at_rest(dv(&[0.0]), 0.0, ControlLaw::default());
        buf.append(&[dv(&[1.0])], &[2.0], 0.0, false).unwrap();
        assert_eq!(buf.read_time(), None);

        let read = buf.get_reference(&dv(&[0.0]), &dv(&[0.0]), 1.5).unwrap();
        assert_eq!(buf.read_time(), Some(1.5));

        // Rewriting time the servo already acted on
        assert!(matches!(
            buf.override_smooth(&[dv(&[-1.0])], &[dv(&[0.0])], &[1.6], 1.0),
            Err(RefBufError::AlreadyRead { .. })
        ));
        assert_eq!(buf.version().unwrap(), 1);

        // Earlier reads don't move the read time back
        buf.read_at(0.5).unwrap();
        assert_eq!(buf.read_time(), Some(1.5));

        // Splicing at the read time keeps what was read
        buf.override_smooth(&[dv(&[-1.0])], &[dv(&[0.0])], &[2.5], 1.5)
            .unwrap();
        let after = buf.get_reference(&dv(&[0.0]), &dv(&[0.0]), 1.5).unwrap();
        assert!((after.q[0] - read.q[0]).abs() < 1e-12);
        assert!((after.q_dot[0] - read.q_dot[0]).abs() < 1e-9);

        // Appending behind an already executed end is refused too
        buf.read_at(3.0).unwrap();
        assert!(matches!(
            buf.append(&[dv(&[0.0])], &[0.5], 2.8, true),
            Err(RefBufError::AlreadyRead { .. })
        ));
        buf.append(&[dv(&[0.0])], &[0.5], 3.0, true).unwrap();
    }

    #[test]
    fn test_hold_and_law() {
        let buf = RefBuffer::at_rest(zero(), 0.0, ControlLaw::default());
        let q = dv(&[0.4, 0.2]);

        buf.hold(false, false, &q).unwrap();
        let first = buf.snapshot().unwrap().reference.clone();
        buf.hold(false, false, &q).unwrap();
        let second = buf.snapshot().unwrap().reference.clone();
        assert_eq!(first, second);

        let s = buf
            .get_reference(&dv(&[9.0, 9.0]), &dv(&[1.0, 1.0]), 10.0)
            .unwrap();
        assert_eq!(s.q, q);
        assert_eq!(s.q_dot, zero());

        let law = ControlLaw::ConfigRefs {
            decay_time: 0.5,
            damping_ratio: 0.8,
        };
        buf.set_control_law(law.clone()).unwrap();
        let snap = buf.snapshot().unwrap();
        assert_eq!(snap.law, law);
        assert_eq!(snap.reference, second);

        // Gains can't be derived from a zero decay time or damping ratio
        for (decay_time, damping_ratio) in [(0.0, 1.0), (0.2, 0.0), (f64::NAN, 1.0)].iter() {
            assert!(matches!(
                buf.set_control_law(ControlLaw::ConfigRefs {
                    decay_time: *decay_time,
                    damping_ratio: *damping_ratio,
                }),
                Err(RefBufError::InvalidLaw(_))
            ));
        }
        assert_eq!(buf.snapshot().unwrap().law, law);
    }

    #[test]
    fn test_ensure_motion() {
        let buf = RefBuffer::at_rest(zero(), 0.0, ControlLaw::default());
        assert_eq!(buf.ensure_motion(&zero(), 0.5).unwrap(), None);

        let q = dv(&[0.4, 0.2]);
        buf.hold(false, false, &q).unwrap();
        assert_eq!(buf.ensure_motion(&dv(&[1.0, 1.0]), 3.0).unwrap(), Some(2));

        // Rests at the held position, not the measured one
        let snap = buf.snapshot().unwrap();
        let spline = snap.reference.spline().unwrap();
        assert_eq!(spline.knots().len(), 1);
        assert_eq!(spline.eval_pos(3.0), q);
        assert!((spline.begin_time() - 3.0).abs() < 1e-12);
    }
}
