//! Sequence controller state

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::{debug, warn};
use nalgebra::Isometry3;
use serde::Serialize;

use super::*;
use crate::{
    joint_state::JointState,
    ref_buf::RefSample,
    scene::Scene,
    spline::SplineSegment,
    timing_mpc::TimingMpc,
    waypoint_mpc::{Objective, ObjectiveSet, Plan, WaypointError, WaypointMpc},
};
use util::{module::State, params, session::Session};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub struct SeqCtrl {
    params: Params,

    waypoint_mpc: WaypointMpc,
    timing_mpc: TimingMpc,

    policy: Box<dyn ReplanPolicy>,

    /// True if the policy was supplied by the user and must survive re-initialisation
    custom_policy: bool,

    mode: SeqCtrlMode,

    /// Current feasible plan
    plan: Option<Plan>,

    last_feasible: bool,

    /// Control time of the last waypoint solve
    last_solve_time: Option<f64>,

    /// Flagged objectives and referenced frame poses at the last waypoint solve
    flagged_snapshot: Option<FlaggedSnapshot>,

    report: StatusReport,
}

/// Everything the controller needs for one cycle.
#[derive(Debug, Clone)]
pub struct CycleInput {
    /// Snapshot of the scene for this cycle
    pub scene: Scene,

    pub objectives: ObjectiveSet,

    /// Latest measured state, its time is the current control time
    pub state: JointState,

    /// Reference at the current control time
    pub ref_now: RefSample,

    /// Reference at the splice time `ctrl_time + tau_cutoff`
    pub ref_splice: RefSample,
}

/// Result of a cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleOutput {
    /// Segment to write into the reference buffer, `None` to leave it unchanged
    pub segment: Option<SplineSegment>,

    /// Time from which `segment` replaces the reference
    pub splice_time: f64,

    /// Set when a new plan was accepted this cycle
    pub new_plan: Option<Plan>,
}

/// Status of the controller after a cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub mode: SeqCtrlMode,

    /// Index of the first waypoint not yet reached
    pub phase: usize,

    /// Number of waypoints in the current plan
    pub num_waypoints: usize,

    /// Why the waypoints were re-solved this cycle, if they were
    pub replan_reason: Option<ReplanReason>,

    /// Whether the last waypoint solve was feasible
    pub feasible: bool,

    /// Time until the last waypoint is reached
    pub time_to_go: Option<f64>,

    /// Distance between the measured state and the reference
    pub tracking_error: f64,

    /// Recoverable problem raised this cycle
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct FlaggedSnapshot {
    objectives: Vec<Objective>,
    poses: Vec<(String, Option<Isometry3<f64>>)>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeqCtrlMode {
    Idle,
    Planned,
    Committed,
}

#[derive(Debug, thiserror::Error)]
pub enum SeqCtrlError {
    #[error("Could not load parameters: {0}")]
    ParamLoadError(params::LoadError),

    #[error("Waypoint planner error: {0}")]
    Waypoint(#[from] WaypointError),

    #[error("Measured state has {found} joints, the scene has {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for SeqCtrlMode {
    fn default() -> Self {
        Self::Idle
    }
}

impl SeqCtrl {
    pub fn new(params: Params, waypoint_mpc: WaypointMpc, timing_mpc: TimingMpc) -> Self {
        let policy = Box::new(DefaultPolicy::new(params.replan_cutoff_s));

        Self {
            params,
            waypoint_mpc,
            timing_mpc,
            policy,
            custom_policy: false,
            mode: SeqCtrlMode::Idle,
            plan: None,
            last_feasible: true,
            last_solve_time: None,
            flagged_snapshot: None,
            report: StatusReport::default(),
        }
    }

    /// Use a different re-plan policy.
    pub fn with_policy(mut self, policy: Box<dyn ReplanPolicy>) -> Self {
        self.policy = policy;
        self.custom_policy = true;
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn mode(&self) -> SeqCtrlMode {
        self.mode
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn status(&self) -> &StatusReport {
        &self.report
    }

    pub fn waypoint_mpc(&self) -> &WaypointMpc {
        &self.waypoint_mpc
    }

    pub fn timing_mpc(&self) -> &TimingMpc {
        &self.timing_mpc
    }

    /// Mutable access to the timing planner, for instance to change the costs between cycles.
    pub fn timing_mpc_mut(&mut self) -> &mut TimingMpc {
        &mut self.timing_mpc
    }

    /// Run one control cycle.
    pub fn cycle(&mut self, input: &CycleInput) -> Result<CycleOutput, SeqCtrlError> {
        let ctrl_time = input.state.time;
        let splice_time = ctrl_time + self.params.tau_cutoff_s;

        let mut output = CycleOutput {
            segment: None,
            splice_time,
            new_plan: None,
        };
        self.report = StatusReport::default();

        if input.state.q.len() != input.scene.dof() {
            return Err(SeqCtrlError::DimensionMismatch {
                expected: input.scene.dof(),
                found: input.state.q.len(),
            });
        }

        // ---- WAYPOINTS ----

        let ctx = ReplanContext {
            has_plan: self.plan.is_some(),
            last_feasible: self.last_feasible,
            flagged_changed: self.flagged_changed(&input.scene, &input.objectives),
            since_last_solve: self.last_solve_time.map(|t| ctrl_time - t),
        };

        if let Some(reason) = self.policy.should_replan(&ctx) {
            debug!("Re-planning waypoints at {:.3} s ({:?})", ctrl_time, reason);
            self.report.replan_reason = Some(reason);

            let plan = self
                .waypoint_mpc
                .solve(&input.scene, &input.state.q, &input.objectives)?;

            self.last_solve_time = Some(ctrl_time);
            self.flagged_snapshot = Some(FlaggedSnapshot::capture(
                &input.scene,
                &input.objectives,
            ));
            self.last_feasible = plan.feasible;

            if plan.feasible {
                // The same waypoints again keep their timing progress
                let same = match self.plan {
                    Some(ref held) => held.waypoints == plan.waypoints,
                    None => false,
                };
                if !same {
                    self.timing_mpc.set_waypoints(plan.waypoints.clone());
                }

                self.plan = Some(plan.clone());
                output.new_plan = Some(plan);
                if self.mode == SeqCtrlMode::Idle {
                    self.mode = SeqCtrlMode::Planned;
                }
            } else {
                // The held plan and the mode stay as they were
                self.raise_warning("Waypoint plan is infeasible, keeping the committed reference");
                self.finish_report(ctrl_time);
                return Ok(output);
            }
        }

        if self.plan.is_none() {
            self.finish_report(ctrl_time);
            return Ok(output);
        }

        // ---- TIMING ----

        let tracking_error = (&input.state.q - &input.ref_now.q).norm();
        self.report.tracking_error = tracking_error;

        self.timing_mpc
            .retire(splice_time, tracking_error, self.params.precision);

        if self.timing_mpc.is_done() {
            self.finish_report(ctrl_time);
            return Ok(output);
        }

        let timed = self
            .timing_mpc
            .solve(&input.ref_splice.q, &input.ref_splice.q_dot, splice_time)
            .and_then(|d| {
                let segment = self.timing_mpc.as_spline(&d, splice_time)?;
                Ok((d, segment))
            });

        match timed {
            Ok((durations, segment)) => {
                if let Some(ref plan) = self.plan {
                    let timed_plan = Plan {
                        waypoints: plan.waypoints.clone(),
                        feasible: plan.feasible,
                        durations: Some(durations),
                    };
                    if output.new_plan.is_some() {
                        output.new_plan = Some(timed_plan.clone());
                    }
                    self.plan = Some(timed_plan);
                }
                output.segment = Some(segment);
                self.mode = SeqCtrlMode::Committed;
            }
            Err(e) => {
                self.raise_warning(&format!(
                    "Timing failed ({}), keeping the committed reference",
                    e
                ));
            }
        }

        self.finish_report(ctrl_time);

        Ok(output)
    }

    /// Log a one line summary of the controller state.
    pub fn report(&self) {
        let r = &self.report;
        debug!(
            "SeqCtrl {:?}: phase {}/{}, feasible: {}, time to go: {}, tracking error: {:.4}{}",
            r.mode,
            r.phase,
            r.num_waypoints,
            r.feasible,
            match r.time_to_go {
                Some(t) => format!("{:.3} s", t),
                None => "-".into(),
            },
            r.tracking_error,
            match r.replan_reason {
                Some(ref reason) => format!(", re-planned ({:?})", reason),
                None => String::new(),
            }
        );
    }

    fn flagged_changed(&self, scene: &Scene, objectives: &ObjectiveSet) -> bool {
        match self.flagged_snapshot {
            Some(ref snap) => snap.differs(scene, objectives, self.params.pose_tolerance),
            None => true,
        }
    }

    fn raise_warning(&mut self, msg: &str) {
        warn!("{}", msg);
        self.report.warning = Some(msg.into());
    }

    fn finish_report(&mut self, ctrl_time: f64) {
        self.report.mode = self.mode;
        self.report.phase = self.timing_mpc.phase();
        self.report.num_waypoints = self.timing_mpc.waypoints().len();
        self.report.feasible = self.last_feasible;
        self.report.time_to_go = self.timing_mpc.time_to_go(ctrl_time);
    }
}

impl State for SeqCtrl {
    type InitData = &'static str;
    type InitError = SeqCtrlError;

    type InputData = CycleInput;
    type OutputData = CycleOutput;
    type StatusReport = StatusReport;
    type ProcError = SeqCtrlError;

    /// Load the parameters from the given file and reset the controller.
    fn init(
        &mut self,
        init_data: Self::InitData,
        session: Option<&Session>,
    ) -> Result<(), Self::InitError> {
        let params: Params = params::load(init_data).map_err(SeqCtrlError::ParamLoadError)?;

        if let Some(s) = session {
            s.save("seq_ctrl/params.json", params.clone());
        }

        if !self.custom_policy {
            self.policy = Box::new(DefaultPolicy::new(params.replan_cutoff_s));
        }

        self.params = params;
        self.mode = SeqCtrlMode::Idle;
        self.plan = None;
        self.last_feasible = true;
        self.last_solve_time = None;
        self.flagged_snapshot = None;
        self.report = StatusReport::default();

        Ok(())
    }

    fn proc(
        &mut self,
        input_data: &Self::InputData,
    ) -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError> {
        let output = self.cycle(input_data)?;
        Ok((output, self.report.clone()))
    }
}

impl FlaggedSnapshot {
    fn capture(scene: &Scene, objectives: &ObjectiveSet) -> Self {
        Self {
            objectives: objectives.flagged.clone(),
            poses: objectives
                .flagged_frames()
                .into_iter()
                .map(|name| {
                    let pose = scene.world_pose(&name).ok();
                    (name, pose)
                })
                .collect(),
        }
    }

    fn differs(&self, scene: &Scene, objectives: &ObjectiveSet, tolerance: f64) -> bool {
        if self.objectives != objectives.flagged {
            return true;
        }

        self.poses.iter().any(|(name, old)| {
            match (old, scene.world_pose(name).ok()) {
                (Some(a), Some(b)) => {
                    (a.translation.vector - b.translation.vector).norm() > tolerance
                        || a.rotation.angle_to(&b.rotation) > tolerance
                }
                (None, None) => false,
                _ => true,
            }
        })
    }
}
