//! # Cycle driver
//!
//! Runs the sequence controller at the planning rate. Each cycle the driver:
//!
//! 1. Waits for the next tick of its [`Metronome`].
//! 2. Pulls motion capture poses into the scene, if a stream was given.
//! 3. Reads the latest measured state and samples the reference at the current control time and
//!    at the splice time.
//! 4. Runs the controller and writes any segment it produced into the reference buffer.
//! 5. Hands the scene, objectives and status report to the caller, who may change the objectives
//!    or ask the driver to stop.
//!
//! The driver never blocks the servo loop, it only reads and writes the shared buffers.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod metronome;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
    joint_state::{StateBufError, StateBuffer},
    mocap::{MocapError, PoseStream},
    ref_buf::{RefBufError, RefBuffer},
    scene::{Scene, SceneError},
    seq_ctrl::{CycleInput, SeqCtrl, SeqCtrlError, StatusReport},
    waypoint_mpc::ObjectiveSet,
};
use util::{module::State, session};

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use metronome::Metronome;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters of the cycle driver
#[derive(Debug, Clone, Deserialize)]
pub struct Params {
    /// Period of the planning cycle
    ///
    /// Units: seconds
    pub period_s: f64,

    /// Stop after this many cycles, 0 runs until stopped
    #[serde(default)]
    pub max_cycles: u64,

    /// Save every newly accepted plan to the session
    #[serde(default)]
    pub archive_plans: bool,
}

pub struct CycleDriver {
    params: Params,

    ref_buf: Arc<RefBuffer>,
    state_buf: Arc<StateBuffer>,

    mocap: Option<Arc<PoseStream>>,

    stop: Arc<AtomicBool>,
}

/// Statistics returned by [`CycleDriver::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub cycles: u64,

    /// Cycles which started late
    pub overruns: u64,

    /// Cycles skipped because no state had been measured yet
    pub skipped: u64,

    /// Number of segments written into the reference buffer
    pub segments_written: u64,

    /// Segments refused because the servo had already read past their splice time
    pub dropped: u64,

    /// Number of plans accepted
    pub plans: u64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Reference buffer error: {0}")]
    RefBuf(#[from] RefBufError),

    #[error("State buffer error: {0}")]
    StateBuf(#[from] StateBufError),

    #[error("Sequence controller error: {0}")]
    SeqCtrl(#[from] SeqCtrlError),

    #[error("Motion capture error: {0}")]
    Mocap(#[from] MocapError),

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("Scene lock is poisoned")]
    PoisonError,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for Params {
    fn default() -> Self {
        Self {
            period_s: 0.02,
            max_cycles: 0,
            archive_plans: false,
        }
    }
}

impl CycleDriver {
    pub fn new(params: Params, ref_buf: Arc<RefBuffer>, state_buf: Arc<StateBuffer>) -> Self {
        Self {
            params,
            ref_buf,
            state_buf,
            mocap: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pull poses from the given motion capture stream every cycle.
    pub fn with_mocap(mut self, stream: Arc<PoseStream>) -> Self {
        self.mocap = Some(stream);
        self
    }

    /// Shared stop flag, raising it ends [`CycleDriver::run`] after the current cycle.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run cycles until stopped, `max_cycles` is reached or `on_cycle` returns false.
    pub fn run<F>(
        &mut self,
        ctrl: &mut SeqCtrl,
        scene: &RwLock<Scene>,
        objectives: &mut ObjectiveSet,
        mut on_cycle: F,
    ) -> Result<CycleSummary, CycleError>
    where
        F: FnMut(&mut Scene, &mut ObjectiveSet, &StatusReport) -> bool,
    {
        info!("Cycle driver started at {:.1} Hz", 1.0 / self.params.period_s);

        let mut metronome = Metronome::from_secs_f64(self.params.period_s);
        let mut summary = CycleSummary::default();

        while !self.stop.load(Ordering::Relaxed) {
            if self.params.max_cycles > 0 && summary.cycles >= self.params.max_cycles {
                break;
            }

            let report = self.cycle(ctrl, scene, objectives, &mut summary)?;
            summary.cycles += 1;

            if let Some(ref r) = report {
                let mut scene = scene.write().map_err(|_| CycleError::PoisonError)?;
                if !on_cycle(&mut scene, objectives, r) {
                    debug!("Cycle driver stopped by its caller");
                    break;
                }
            }

            if metronome.wait_for_tick() > 0 {
                summary.overruns += 1;
                trace!("Cycle {} overran", summary.cycles);
            }
        }

        info!(
            "Cycle driver stopped after {} cycles ({} overruns, {} segments, {} dropped, {} plans)",
            summary.cycles,
            summary.overruns,
            summary.segments_written,
            summary.dropped,
            summary.plans
        );

        Ok(summary)
    }

    /// Run a single cycle without waiting.
    ///
    /// Returns `None` if no state has been measured yet.
    pub fn cycle(
        &mut self,
        ctrl: &mut SeqCtrl,
        scene: &RwLock<Scene>,
        objectives: &ObjectiveSet,
        summary: &mut CycleSummary,
    ) -> Result<Option<StatusReport>, CycleError> {
        let state = match self.state_buf.get()? {
            Some(s) => s,
            None => {
                summary.skipped += 1;
                return Ok(None);
            }
        };
        let t = state.time;

        // ---- SCENE ----

        let scene_snapshot = {
            let mut scene = scene.write().map_err(|_| CycleError::PoisonError)?;
            scene.set_from(&state)?;
            if let Some(ref stream) = self.mocap {
                stream.pull(&mut scene)?;
            }
            scene.clone()
        };

        // ---- REFERENCE ----

        let snapshot = self.ref_buf.snapshot()?;
        let splice_time = t + ctrl.params().tau_cutoff_s;
        let ref_now = snapshot.reference.sample(&state.q, &state.q_dot, t);
        let ref_splice = snapshot.reference.sample(&state.q, &state.q_dot, splice_time);

        // ---- CONTROLLER ----

        let input = CycleInput {
            scene: scene_snapshot,
            objectives: objectives.clone(),
            state,
            ref_now,
            ref_splice,
        };

        let (output, report) = ctrl.proc(&input)?;
        ctrl.report();

        if let Some(plan) = output.new_plan {
            summary.plans += 1;
            if self.params.archive_plans {
                session::save_with_timestamp("plans/plan.json", plan);
            }
        }

        if let Some(segment) = output.segment {
            if snapshot.reference.is_hold() {
                debug!("Leaving hold mode for a planned segment");
                self.ref_buf.ensure_motion(&input.state.q, t)?;
            }

            match self.ref_buf.override_segment(&segment, output.splice_time) {
                Ok(v) => {
                    summary.segments_written += 1;
                    trace!(
                        "Segment of {} knots written at {:.3} s (v{})",
                        segment.len(),
                        output.splice_time,
                        v
                    );
                }
                // A late cycle, or someone else rewrote the horizon. Try again next cycle
                Err(e) if e.is_causality() => {
                    summary.dropped += 1;
                    warn!("Segment dropped: {}", e)
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(report))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        joint_state::JointState,
        ref_buf::ControlLaw,
        seq_ctrl::{Params as SeqParams, SeqCtrlMode},
        timing_mpc::{Params as TimingParams, TimingMpc},
        waypoint_mpc::{Feature, Objective, Params as WaypointParams, WaypointMpc},
    };
    use nalgebra::DVector;

    fn ctrl() -> SeqCtrl {
        SeqCtrl::new(
            SeqParams::default(),
            WaypointMpc::with_joint_space(WaypointParams::default()),
            TimingMpc::with_bounded(TimingParams::default()),
        )
    }

    #[test]
    fn test_cycle_writes_segment() {
        let q = DVector::zeros(2);
        let ref_buf = Arc::new(RefBuffer::at_rest(q.clone(), 0.0, ControlLaw::default()));
        let state_buf = Arc::new(StateBuffer::new());
        let scene = RwLock::new(Scene::new(&["a", "b"]));
        let mut driver = CycleDriver::new(Params::default(), ref_buf.clone(), state_buf.clone());
        let mut ctrl = ctrl();
        let mut summary = CycleSummary::default();

        let objectives = ObjectiveSet::new(
            vec![Objective::new(
                "target",
                Feature::JointTarget,
                DVector::from_column_slice(&[0.5, -0.5]),
                1.0,
            )],
            vec![],
        );

        // Nothing measured yet
        let report = driver
            .cycle(&mut ctrl, &scene, &objectives, &mut summary)
            .unwrap();
        assert!(report.is_none());
        assert_eq!(summary.skipped, 1);

        state_buf.publish(JointState::at_rest(q, 0.0)).unwrap();
        let report = driver
            .cycle(&mut ctrl, &scene, &objectives, &mut summary)
            .unwrap()
            .unwrap();

        assert_eq!(report.mode, SeqCtrlMode::Committed);
        assert_eq!(summary.segments_written, 1);
        assert_eq!(summary.plans, 1);
        assert_eq!(ref_buf.version().unwrap(), 1);

        let end = ref_buf.snapshot().unwrap();
        let spline = end.reference.spline().unwrap();
        assert!((spline.eval_pos(spline.end_time())[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_late_cycle_drops_segment() {
        let q = DVector::zeros(1);
        let ref_buf = Arc::new(RefBuffer::at_rest(q.clone(), 0.0, ControlLaw::default()));
        ref_buf
            .append(&[DVector::from_element(1, 1.0)], &[2.0], 0.0, false)
            .unwrap();
        let state_buf = Arc::new(StateBuffer::new());
        let scene = RwLock::new(Scene::new(&["a"]));
        let mut driver = CycleDriver::new(Params::default(), ref_buf.clone(), state_buf.clone());
        let mut ctrl = ctrl();
        let mut summary = CycleSummary::default();

        let objectives = ObjectiveSet::new(
            vec![Objective::new(
                "target",
                Feature::JointTarget,
                DVector::from_element(1, -1.0),
                1.0,
            )],
            vec![],
        );

        // The state is from 0.5 s but the servo has already moved on to 0.9 s
        let s = ref_buf.get_reference(&q, &q, 0.5).unwrap();
        state_buf.publish(JointState::new(s.q, s.q_dot, 0.5)).unwrap();
        let executed = ref_buf.get_reference(&q, &q, 0.9).unwrap();
        let before = ref_buf.snapshot().unwrap();

        let report = driver
            .cycle(&mut ctrl, &scene, &objectives, &mut summary)
            .unwrap()
            .unwrap();

        assert!(report.replan_reason.is_some());
        assert_eq!(summary.segments_written, 0);
        assert_eq!(summary.dropped, 1);
        assert!(Arc::ptr_eq(&before, &ref_buf.snapshot().unwrap()));
        assert_eq!(ref_buf.get_reference(&q, &q, 0.9).unwrap(), executed);
    }
}
