//! Properties of the planning side: reference continuity, commitment and feasibility gating.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};

use nalgebra::{DVector, Isometry3, Vector3};

use bot_lib::{
    cycle::{CycleDriver, CycleSummary, Params as CycleParams},
    joint_state::{JointState, StateBuffer},
    ref_buf::{ControlLaw, RefBuffer, RefSnapshot},
    scene::Scene,
    seq_ctrl::{Params as SeqParams, SeqCtrl, SeqCtrlMode, StatusReport},
    spline::knot_velocities,
    timing_mpc::{Params as TimingParams, TimingMpc},
    waypoint_mpc::{
        Feature, Objective, ObjectiveSet, OptimResult, Params as WaypointParams,
        TrajectoryOptimizer, WaypointError, WaypointMpc,
    },
};

// ------------------------------------------------------------------------------------------------
// HELPERS
// ------------------------------------------------------------------------------------------------

fn dv(v: &[f64]) -> DVector<f64> {
    DVector::from_column_slice(v)
}

/// Planning side wired to the buffers, with the measured state published by hand.
struct Rig {
    ref_buf: Arc<RefBuffer>,
    state_buf: Arc<StateBuffer>,
    scene: RwLock<Scene>,
    driver: CycleDriver,
    summary: CycleSummary,
}

impl Rig {
    fn new() -> Self {
        let ref_buf = Arc::new(RefBuffer::at_rest(
            DVector::zeros(3),
            0.0,
            ControlLaw::default(),
        ));
        let state_buf = Arc::new(StateBuffer::new());

        let mut scene = Scene::new(&["x", "y", "z"]);
        scene
            .add_frame("ball", None, Isometry3::translation(0.2, 0.2, 0.2))
            .unwrap();

        let driver = CycleDriver::new(CycleParams::default(), ref_buf.clone(), state_buf.clone());

        Self {
            ref_buf,
            state_buf,
            scene: RwLock::new(scene),
            driver,
            summary: CycleSummary::default(),
        }
    }

    /// Publish a state tracking the reference perfectly at `t` and run one cycle.
    fn cycle_at(&mut self, ctrl: &mut SeqCtrl, objectives: &ObjectiveSet, t: f64) -> StatusReport {
        let zeros = DVector::zeros(3);
        let s = self.ref_buf.get_reference(&zeros, &zeros, t).unwrap();
        self.state_buf.publish(JointState::new(s.q, s.q_dot, t)).unwrap();

        self.driver
            .cycle(ctrl, &self.scene, objectives, &mut self.summary)
            .unwrap()
            .unwrap()
    }

    fn move_ball(&self, x: f64, y: f64, z: f64) {
        self.scene
            .write()
            .unwrap()
            .set_position("ball", Vector3::new(x, y, z))
            .unwrap();
    }
}

fn ctrl() -> SeqCtrl {
    SeqCtrl::new(
        SeqParams::default(),
        WaypointMpc::with_joint_space(WaypointParams::default()),
        TimingMpc::with_bounded(TimingParams::default()),
    )
}

fn follow_ball(limit: f64) -> ObjectiveSet {
    let mut limits = DVector::from_element(6, -limit);
    limits.rows_mut(3, 3).fill(limit);

    ObjectiveSet::new(
        vec![Objective::new("follow", Feature::FrameTarget, DVector::zeros(3), 1.0)
            .with_frames(&["ball"])],
        vec![Objective::new("limits", Feature::JointLimits, limits, 0.0)],
    )
}

fn assert_same_between(a: &RefSnapshot, b: &RefSnapshot, from: f64, to: f64) {
    let (sa, sb) = (a.reference.spline().unwrap(), b.reference.spline().unwrap());
    let n = 40;
    for i in 0..=n {
        let t = from + (to - from) * i as f64 / n as f64;
        let (ea, eb) = (sa.eval(t), sb.eval(t));
        assert!((&ea.pos - &eb.pos).norm() < 1e-9, "position changed at {}", t);
        assert!((&ea.vel - &eb.vel).norm() < 1e-9, "velocity changed at {}", t);
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[test]
fn test_override_is_continuous() {
    let buf = RefBuffer::at_rest(dv(&[0.0, 0.0]), 0.0, ControlLaw::default());
    buf.append(&[dv(&[0.5, -0.2]), dv(&[1.0, 0.4])], &[0.6, 1.2], 0.0, true)
        .unwrap();
    let before = buf.snapshot().unwrap();

    // Head somewhere else entirely from 0.45 s on
    let from = 0.45;
    let path = vec![dv(&[-1.0, 2.0]), dv(&[0.0, 0.0])];
    let times = vec![1.0, 1.5];
    let start = before.reference.spline().unwrap().eval_pos(from);
    let vels = knot_velocities((from, &start), &path, &times);
    buf.override_smooth(&path, &vels, &times, from).unwrap();

    let after = buf.snapshot().unwrap();
    let spline = after.reference.spline().unwrap();

    // The past is untouched
    assert_same_between(&before, &after, 0.0, from);

    // No jump in position or velocity across the splice
    let eps = 1e-7;
    let (l, r) = (spline.eval(from - eps), spline.eval(from + eps));
    assert!((&l.pos - &r.pos).norm() < 1e-5);
    assert!((&l.vel - &r.vel).norm() < 1e-4);

    assert_eq!(spline.eval_pos(1.5), dv(&[0.0, 0.0]));
}

#[test]
fn test_frozen_window_never_changes() {
    let mut rig = Rig::new();
    let mut ctrl = ctrl();
    let objectives = follow_ball(10.0);
    let tau_cutoff = ctrl.params().tau_cutoff_s;

    for k in 0..80 {
        let t = 0.02 * k as f64;

        // Keep the ball moving so most cycles re-plan
        let phase = 0.3 * k as f64;
        rig.move_ball(0.2 + 0.1 * phase.sin(), 0.2 + 0.1 * phase.cos(), 0.2);

        let before = rig.ref_buf.snapshot().unwrap();
        rig.cycle_at(&mut ctrl, &objectives, t);
        let after = rig.ref_buf.snapshot().unwrap();

        assert_same_between(&before, &after, t, t + tau_cutoff);
    }

    assert!(rig.summary.segments_written > 10);
    assert!(rig.summary.plans > 10);
}

#[test]
fn test_infeasible_cycle_leaves_buffer_untouched() {
    let mut rig = Rig::new();
    let mut ctrl = ctrl();
    let objectives = follow_ball(0.5);

    let report = rig.cycle_at(&mut ctrl, &objectives, 0.0);
    assert_eq!(report.mode, SeqCtrlMode::Committed);
    assert_eq!(rig.ref_buf.version().unwrap(), 1);
    let committed = ctrl.plan().cloned().unwrap();

    // Out of reach
    rig.move_ball(0.9, 0.0, 0.2);

    let before = rig.ref_buf.snapshot().unwrap();
    let report = rig.cycle_at(&mut ctrl, &objectives, 0.02);
    let after = rig.ref_buf.snapshot().unwrap();

    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(*before, *after);
    assert_eq!(report.mode, SeqCtrlMode::Committed);
    assert!(!report.feasible);
    assert_eq!(ctrl.plan(), Some(&committed));

    // The warning is part of the archived report
    let json = serde_json::to_value(&report).unwrap();
    assert!(json["warning"].is_string());

    // Back in reach, planning resumes
    rig.move_ball(0.1, 0.0, 0.2);
    let report = rig.cycle_at(&mut ctrl, &objectives, 0.04);
    assert_eq!(report.mode, SeqCtrlMode::Committed);
    assert_eq!(rig.ref_buf.version().unwrap(), 2);
}

#[test]
fn test_hold_is_idempotent() {
    let buf = RefBuffer::at_rest(dv(&[0.0, 0.0, 0.0]), 0.0, ControlLaw::default());
    let q = dv(&[0.1, -0.3, 0.7]);

    buf.hold(false, true, &q).unwrap();
    let first = buf.snapshot().unwrap();
    buf.hold(false, true, &q).unwrap();
    let second = buf.snapshot().unwrap();

    assert_eq!(first.reference, second.reference);
    assert_eq!(first.law, second.law);
    assert_eq!(second.version, first.version + 1);

    // The held reference ignores the measured state
    let s = buf
        .get_reference(&dv(&[5.0, 5.0, 5.0]), &dv(&[1.0, 1.0, 1.0]), 3.0)
        .unwrap();
    assert_eq!(s.q, q);
    assert_eq!(s.q_dot, DVector::zeros(3));
}

// ------------------------------------------------------------------------------------------------
// RE-PLAN RATE
// ------------------------------------------------------------------------------------------------

/// Goes straight to a fixed target and counts its solves.
struct CountingOptimizer {
    solves: Arc<AtomicUsize>,
    target: DVector<f64>,
}

impl TrajectoryOptimizer for CountingOptimizer {
    fn solve(
        &mut self,
        _scene: &Scene,
        _flagged: &[Objective],
        _running: &[Objective],
        _seed: &DVector<f64>,
    ) -> Result<OptimResult, WaypointError> {
        self.solves.fetch_add(1, Ordering::SeqCst);
        Ok(OptimResult {
            path: vec![self.target.clone()],
            feasible: true,
            durations: None,
            message: None,
        })
    }

    fn reinit(&mut self, _scene: &Scene) {}
}

#[test]
fn test_replan_rate_under_static_objectives() {
    let solves = Arc::new(AtomicUsize::new(0));
    let mut rig = Rig::new();
    let mut ctrl = SeqCtrl::new(
        SeqParams {
            replan_cutoff_s: 0.1,
            ..SeqParams::default()
        },
        WaypointMpc::new(Box::new(CountingOptimizer {
            solves: solves.clone(),
            target: dv(&[0.3, -0.3, 0.5]),
        })),
        TimingMpc::with_bounded(TimingParams::default()),
    );
    let objectives = follow_ball(10.0);

    let mut solve_times = Vec::new();
    let mut last_count = 0;

    for k in 0..100 {
        let t = 0.02 * k as f64;
        rig.cycle_at(&mut ctrl, &objectives, t);

        let count = solves.load(Ordering::SeqCst);
        if count > last_count {
            assert_eq!(count, last_count + 1);
            solve_times.push(t);
            last_count = count;
        }
    }

    // Never more than one solve per cutoff window, and the plan is kept fresh
    assert!(solve_times.len() >= 2);
    for w in solve_times.windows(2) {
        assert!(w[1] - w[0] > 0.1 - 1e-9, "solves at {} and {}", w[0], w[1]);
    }
    assert!(solve_times.len() <= 1 + (2.0 / 0.1) as usize);
}
