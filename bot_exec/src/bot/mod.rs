//! # Bot operator
//!
//! A direct, blocking interface to the robot for scripts and experiments. The operator owns the
//! reference and state buffers and the servo thread, and writes motions straight into the
//! reference buffer without going through the planners.
//!
//! Motions are written relative to the current control time. `move_path` appends to whatever is
//! already queued, while `move_override` and `move_leap` replace the reference from now on,
//! smoothly continuing the current motion.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod params;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{sync::Arc, thread, time::Duration};

use log::{debug, error, info, warn};
use nalgebra::DVector;

use crate::{
    joint_state::{JointState, StateBufError, StateBuffer},
    ref_buf::{ControlLaw, RefBufError, RefBuffer, RefSample},
    scene::{Scene, SceneError},
    servo::{
        self, Actuator, ActuatorError, Emulator, Servo, ServoError, ServoHandle, ServoLoop,
        ServoSummary,
    },
    spline::knot_velocities,
    timing_mpc::leap_duration,
};

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use params::Params;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Shortest path `move_auto_timed` accepts.
pub const MIN_AUTO_TIMED_STEPS: usize = 16;

/// Shortest leap duration.
///
/// Units: seconds
pub const MIN_LEAP_S: f64 = 0.2;

/// Largest joint distance from home that counts as being at home.
const HOME_TOLERANCE: f64 = 1e-3;

/// Attempts at a write which keeps losing the race against the servo's reads.
const WRITE_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub struct Bot {
    params: Params,

    ref_buf: Arc<RefBuffer>,
    state_buf: Arc<StateBuffer>,

    servo: Option<ServoHandle>,

    q_home: DVector<f64>,

    /// State buffer revision last seen by `step`
    last_revision: u64,

    emulated: bool,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("Servo error: {0}")]
    Servo(#[from] ServoError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Reference buffer error: {0}")]
    RefBuf(#[from] RefBufError),

    #[error("State buffer error: {0}")]
    StateBuf(#[from] StateBufError),

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("The servo loop has stopped, call stop() to get its exit status")]
    ServoStopped,

    #[error("No state has been measured yet")]
    NoState,

    #[error("Home configuration has {found} joints, the robot has {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Attempted to move along an empty path")]
    EmptyPath,

    #[error("Expected {expected} times for the path (or a single duration), found {found}")]
    TimesMismatch { expected: usize, found: usize },

    #[error("Automatic timing needs a smooth path of at least {min} steps, found {found}")]
    PathTooShort { min: usize, found: usize },

    #[error("Automatic timing needs a path that moves")]
    StationaryPath,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Bot {
    /// Start the servo loop on the given actuator.
    pub fn new(
        params: &Params,
        servo_params: &servo::Params,
        actuator: Box<dyn Actuator>,
    ) -> Result<Self, BotError> {
        Self::start(params, servo_params, actuator, false)
    }

    /// Start the servo loop on an emulated plant at rest in `q_init`.
    pub fn emulated(
        params: &Params,
        servo_params: &servo::Params,
        q_init: DVector<f64>,
    ) -> Result<Self, BotError> {
        let emulator = Emulator::new(q_init, servo_params.tau_s);
        Self::start(params, servo_params, Box::new(emulator), true)
    }

    fn start(
        params: &Params,
        servo_params: &servo::Params,
        mut actuator: Box<dyn Actuator>,
        emulated: bool,
    ) -> Result<Self, BotError> {
        params
            .control_law
            .validate()
            .map_err(RefBufError::InvalidLaw)?;

        let initial = actuator.get_state()?;

        let q_home = if params.q_home.is_empty() {
            initial.q.clone()
        } else {
            DVector::from_column_slice(&params.q_home)
        };
        if q_home.len() != initial.dof() {
            return Err(BotError::DimensionMismatch {
                expected: initial.dof(),
                found: q_home.len(),
            });
        }

        // Start at rest where the robot already is
        let ref_buf = Arc::new(RefBuffer::at_rest(
            initial.q.clone(),
            initial.time,
            params.control_law.clone(),
        ));
        let state_buf = Arc::new(StateBuffer::new());

        let servo = Servo::new(actuator, ref_buf.clone(), state_buf.clone());
        let handle = ServoLoop::start(servo, servo_params)?;

        let (revision, _) = state_buf.wait_for_revision(0, timeout(params.state_timeout_s))?;

        info!(
            "Bot started with {} joints ({})",
            initial.dof(),
            if emulated { "emulated" } else { "real" }
        );

        Ok(Self {
            params: params.clone(),
            ref_buf,
            state_buf,
            servo: Some(handle),
            q_home,
            last_revision: revision,
            emulated,
        })
    }

    // ---- ACCESSORS ----

    pub fn ref_buf(&self) -> Arc<RefBuffer> {
        self.ref_buf.clone()
    }

    pub fn state_buf(&self) -> Arc<StateBuffer> {
        self.state_buf.clone()
    }

    pub fn is_emulated(&self) -> bool {
        self.emulated
    }

    pub fn q_home(&self) -> &DVector<f64> {
        &self.q_home
    }

    /// Latest measured state.
    pub fn get_state(&self) -> Result<JointState, BotError> {
        self.state_buf.get()?.ok_or(BotError::NoState)
    }

    /// Current control time.
    pub fn get_t(&self) -> Result<f64, BotError> {
        Ok(self.get_state()?.time)
    }

    pub fn get_q(&self) -> Result<DVector<f64>, BotError> {
        Ok(self.get_state()?.q)
    }

    pub fn get_q_dot(&self) -> Result<DVector<f64>, BotError> {
        Ok(self.get_state()?.q_dot)
    }

    /// Reference at the current control time.
    pub fn get_reference(&self) -> Result<RefSample, BotError> {
        let s = self.get_state()?;
        Ok(self.ref_buf.get_reference(&s.q, &s.q_dot, s.time)?)
    }

    /// Time left until the end of the motion reference.
    ///
    /// There is no end while holding, in which case an error is logged and zero returned.
    pub fn time_to_end(&self) -> Result<f64, BotError> {
        match self.ref_buf.end_time()? {
            Some(end) => Ok(end - self.get_t()?),
            None => {
                error!("Time to end is undefined while holding");
                Ok(0.0)
            }
        }
    }

    // ---- SYNCHRONISATION ----

    /// Wait for a fresh state and mirror it into `scene`.
    ///
    /// Returns false once control time is past the end of the motion reference.
    pub fn step(&mut self, scene: &mut Scene) -> Result<bool, BotError> {
        if !self.servo.as_ref().map(|s| s.is_running()).unwrap_or(false) {
            return Err(BotError::ServoStopped);
        }

        let (revision, state) = self
            .state_buf
            .wait_for_revision(self.last_revision, timeout(self.params.state_timeout_s))?;
        self.last_revision = revision;

        scene.set_from(&state)?;

        if let Some(end) = self.ref_buf.end_time()? {
            if state.time > end {
                return Ok(false);
            }
        }

        if self.params.step_wait_s > 0.0 {
            thread::sleep(Duration::from_secs_f64(self.params.step_wait_s));
        }

        Ok(true)
    }

    // ---- MOTION ----

    /// Queue a path after the current motion.
    ///
    /// `times` are relative to the start of the path, which is the later of now and the end of
    /// the queued motion. A single time is taken as the total duration, with the points spread
    /// evenly over it.
    pub fn move_path(&self, path: &[DVector<f64>], times: &[f64]) -> Result<(), BotError> {
        let times = path_times(path, times)?;
        let state = self.ensure_motion()?;

        self.write_from(&state, |t| self.ref_buf.append(path, &times, t, true))?;

        debug!("Queued a path of {} points over {:.3} s", path.len(), times[times.len() - 1]);
        Ok(())
    }

    /// Queue a densely sampled path, choosing the step duration from its smoothness.
    ///
    /// The step duration is `sqrt(sum |acc|^2 / (time_cost * n))` with accelerations from central
    /// differences. Returns the step duration.
    pub fn move_auto_timed(&self, path: &[DVector<f64>], time_cost: f64) -> Result<f64, BotError> {
        if path.len() < MIN_AUTO_TIMED_STEPS {
            return Err(BotError::PathTooShort {
                min: MIN_AUTO_TIMED_STEPS,
                found: path.len(),
            });
        }

        let n = path.len();
        let acc_sos: f64 = (0..n)
            .map(|t| {
                // The path is taken to be at rest before and after its ends
                let prev = &path[t.saturating_sub(1)];
                let next = &path[(t + 1).min(n - 1)];
                (next + prev - &path[t] * 2.0).norm_squared()
            })
            .sum();

        let tau = (acc_sos / (time_cost * n as f64)).sqrt();
        if !tau.is_finite() || tau <= 0.0 {
            return Err(BotError::StationaryPath);
        }

        let times: Vec<f64> = (0..n).map(|i| tau * (i + 1) as f64).collect();
        self.move_path(path, &times)?;

        Ok(tau)
    }

    /// Replace the motion from now on with `path`, continuing smoothly from the current
    /// reference.
    ///
    /// `times` are relative to now, a single time is a total duration.
    pub fn move_override(&self, path: &[DVector<f64>], times: &[f64]) -> Result<(), BotError> {
        let times = path_times(path, times)?;
        let state = self.ensure_motion()?;
        self.override_from(&state, path, &times)
    }

    /// Move to `q_target` in a single smooth leap, returning its duration.
    ///
    /// The duration trades time against control effort through `time_cost`, and is never shorter
    /// than [`MIN_LEAP_S`].
    pub fn move_leap(&self, q_target: &DVector<f64>, time_cost: f64) -> Result<f64, BotError> {
        let state = self.get_state()?;
        if q_target.len() != state.dof() {
            return Err(BotError::DimensionMismatch {
                expected: state.dof(),
                found: q_target.len(),
            });
        }

        let delta = q_target - &state.q;
        let dist = delta.norm();

        let mut duration = MIN_LEAP_S;
        if dist >= 1e-4 {
            let vel = state.q_dot.dot(&delta) / dist;
            duration = leap_duration(dist, vel, time_cost);
        }
        if duration.is_nan() || duration < MIN_LEAP_S {
            duration = MIN_LEAP_S;
        }

        let path = [q_target.clone()];
        let state = self.ensure_motion()?;
        self.override_from(&state, &path, &[duration])?;

        debug!("Leap of {:.4} over {:.3} s", dist, duration);
        Ok(duration)
    }

    /// Move home, stepping `scene` along until there.
    pub fn home(&mut self, scene: &mut Scene) -> Result<(), BotError> {
        let q = self.get_q()?;
        let max_diff = (&q - &self.q_home).amax();

        if max_diff > HOME_TOLERANCE {
            info!("Homing (max joint distance {:.4})", max_diff);
            let q_home = self.q_home.clone();
            self.move_leap(&q_home, 1.0)?;
            while self.step(scene)? {}
        } else {
            self.move_path(&[self.q_home.clone()], &[0.1])?;
        }

        Ok(())
    }

    /// Hold the current position, or float if `floating` is set.
    ///
    /// A floating robot has no position target. `damping` then selects a zero velocity target
    /// over no velocity target at all.
    pub fn hold(&self, floating: bool, damping: bool) -> Result<(), BotError> {
        let q = self.get_q()?;
        self.ref_buf.hold(floating, damping, &q)?;
        debug!("Holding (floating: {}, damping: {})", floating, damping);
        Ok(())
    }

    pub fn set_control_law(&self, law: ControlLaw) -> Result<(), BotError> {
        self.ref_buf.set_control_law(law)?;
        Ok(())
    }

    /// Stop the servo loop and return its summary.
    pub fn stop(mut self) -> Result<ServoSummary, BotError> {
        match self.servo.take() {
            Some(h) => Ok(h.stop()?),
            None => Ok(ServoSummary::default()),
        }
    }

    /// Switch to motion mode if holding, returning the current state.
    fn ensure_motion(&self) -> Result<JointState, BotError> {
        let state = self.get_state()?;
        if let Some(v) = self.ref_buf.ensure_motion(&state.q, state.time)? {
            debug!("Switched from hold to motion (v{})", v);
        }
        Ok(state)
    }

    /// Override from the current control time with times relative to it.
    fn override_from(
        &self,
        state: &JointState,
        path: &[DVector<f64>],
        times: &[f64],
    ) -> Result<(), BotError> {
        self.write_from(state, |t| {
            let ref_now = self
                .ref_buf
                .snapshot()?
                .reference
                .sample(&state.q, &state.q_dot, t);

            let abs_times: Vec<f64> = times.iter().map(|dt| t + dt).collect();
            let vels = knot_velocities((t, &ref_now.q), path, &abs_times);

            self.ref_buf.override_smooth(path, &vels, &abs_times, t)
        })
    }

    /// Run `write` from the current control time.
    ///
    /// That is the measured time, or the servo's latest read of the reference if it has moved on
    /// since. The servo may read again before the write lands, in which case it is retried.
    fn write_from<F>(&self, state: &JointState, mut write: F) -> Result<(), BotError>
    where
        F: FnMut(f64) -> Result<u64, RefBufError>,
    {
        let mut attempt = 1;
        loop {
            let t = match self.ref_buf.read_time() {
                Some(read) => read.max(state.time),
                None => state.time,
            };

            match write(t) {
                Ok(_) => return Ok(()),
                Err(e @ RefBufError::AlreadyRead { .. }) if attempt < WRITE_ATTEMPTS => {
                    debug!("Retrying write ({})", e);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for Bot {
    fn drop(&mut self) {
        if let Some(h) = self.servo.take() {
            if let Err(e) = h.stop() {
                warn!("Servo loop exited with an error: {}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Relative knot times for a path, spreading a single duration evenly.
fn path_times(path: &[DVector<f64>], times: &[f64]) -> Result<Vec<f64>, BotError> {
    if path.is_empty() {
        return Err(BotError::EmptyPath);
    }

    if times.len() == path.len() {
        return Ok(times.to_vec());
    }

    if times.len() == 1 {
        let n = path.len() as f64;
        return Ok((0..path.len())
            .map(|i| times[0] * (i + 1) as f64 / n)
            .collect());
    }

    Err(BotError::TimesMismatch {
        expected: path.len(),
        found: times.len(),
    })
}

fn timeout(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}
