//! # Bot executable
//!
//! Runs a reactive following experiment on an emulated gantry. A `ball` frame wanders above the
//! table and the sequence controller keeps re-planning so that the gantry's tool point follows
//! it.
//!
//! # Architecture
//!
//!     - Initialise session, logging and parameters
//!     - Build the scene and start the emulated bot, then home it
//!     - Main loop (cycle driver):
//!         - Waypoint and timing planning
//!         - Reference buffer override
//!         - Ball motion
//!     - Stop the servo loop and exit the session

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::sync::RwLock;

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use log::{debug, info};
use nalgebra::{DVector, Isometry3, Vector3};
use noise::{NoiseFn, Perlin};
use serde::Deserialize;

use bot_lib::{
    bot::{self, Bot},
    cycle::{self, CycleDriver},
    scene::Scene,
    seq_ctrl::{self, SeqCtrl},
    servo,
    timing_mpc::{self, TimingMpc},
    waypoint_mpc::{self, Feature, Objective, ObjectiveSet, WaypointMpc},
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    module::State,
    session::{self, Session},
};

// ------------------------------------------------------------------------------------------------
// DATA STRUCTURES
// ------------------------------------------------------------------------------------------------

/// Parameters of the experiment itself
#[derive(Deserialize, Debug, Clone)]
struct ExecParams {
    /// Number of planning cycles to run
    num_cycles: u64,

    /// Names of the gantry joints, the first three must be the x, y and z axes
    joint_names: Vec<String>,

    /// Lower joint limits
    q_lower: Vec<f64>,

    /// Upper joint limits
    q_upper: Vec<f64>,

    /// Position of the table frame in the world
    table_position: [f64; 3],

    /// Position of the ball around which it wanders, relative to the table
    ball_centre: [f64; 3],

    /// Largest distance the ball moves in one cycle
    ///
    /// Units: meters
    ball_step_m: f64,

    /// Number of cycles between changes of the ball's velocity
    ball_change_cycles: u64,

    /// Number of cycles after which the ball pauses
    ball_pause_cycles: u64,

    /// Offset of the tool point from the ball
    ///
    /// Units: meters
    tool_offset: [f64; 3],
}

/// Random walk of the target ball.
struct Ball {
    perlin: Perlin,
    centre: Vector3<f64>,
    vel: Vector3<f64>,
    params: ExecParams,
}

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("bot_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(LevelFilter::Debug, LevelFilter::Trace, &session)
        .wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Bot Executable\n");
    info!("Running on: {}", host::get_hostname());
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let exec_params: ExecParams =
        util::params::load("bot_exec.toml").wrap_err("Could not load exec params")?;
    let servo_params: servo::Params =
        util::params::load("servo.toml").wrap_err("Could not load servo params")?;
    let bot_params: bot::Params =
        util::params::load("bot.toml").wrap_err("Could not load bot params")?;
    let cycle_params: cycle::Params =
        util::params::load("cycle.toml").wrap_err("Could not load cycle params")?;
    let timing_params: timing_mpc::Params =
        util::params::load("timing.toml").wrap_err("Could not load timing params")?;
    let waypoint_params: waypoint_mpc::Params =
        util::params::load("waypoint.toml").wrap_err("Could not load waypoint params")?;

    let dof = exec_params.joint_names.len();
    if dof < 3 || exec_params.q_lower.len() != dof || exec_params.q_upper.len() != dof {
        return Err(eyre!(
            "Expected at least 3 joints with matching limits, found {} joints, {} lower and {} \
            upper limits",
            dof,
            exec_params.q_lower.len(),
            exec_params.q_upper.len()
        ));
    }

    info!("Exec parameters loaded");

    // ---- SCENE ----

    let mut scene = Scene::new(&exec_params.joint_names);
    let t = exec_params.table_position;
    let b = exec_params.ball_centre;
    scene
        .add_frame("table", None, Isometry3::translation(t[0], t[1], t[2]))
        .wrap_err("Could not add the table")?;
    scene
        .add_frame("ball", Some("table"), Isometry3::translation(b[0], b[1], b[2]))
        .wrap_err("Could not add the ball")?;

    // ---- BOT ----

    let mut bot = Bot::emulated(&bot_params, &servo_params, DVector::zeros(dof))
        .wrap_err("Failed to start the bot")?;
    info!("Bot started, homing");

    bot.home(&mut scene).wrap_err("Failed to home the bot")?;
    info!("Homing complete at t = {:.3} s\n", bot.get_t()?);

    // ---- MODULE INIT ----

    let mut seq_ctrl = SeqCtrl::new(
        seq_ctrl::Params::default(),
        WaypointMpc::with_joint_space(waypoint_params),
        TimingMpc::with_bounded(timing_params),
    );
    seq_ctrl
        .init("seq_ctrl.toml", Some(&session))
        .wrap_err("Failed to initialise SeqCtrl")?;
    info!("SeqCtrl init complete");

    let mut limits = DVector::zeros(2 * dof);
    limits.rows_mut(0, dof).copy_from_slice(&exec_params.q_lower);
    limits.rows_mut(dof, dof).copy_from_slice(&exec_params.q_upper);

    let o = exec_params.tool_offset;
    let mut objectives = ObjectiveSet::new(
        vec![Objective::new(
            "follow_ball",
            Feature::FrameTarget,
            DVector::from_column_slice(&o),
            1.0,
        )
        .with_frames(&["ball"])],
        vec![Objective::new("joint_limits", Feature::JointLimits, limits, 0.0)],
    );

    let mut driver = CycleDriver::new(
        cycle::Params {
            max_cycles: exec_params.num_cycles,
            ..cycle_params
        },
        bot.ref_buf(),
        bot.state_buf(),
    );

    let mut ball = Ball::new(exec_params.clone());

    // ---- MAIN LOOP ----

    info!("Following the ball for {} cycles\n", exec_params.num_cycles);

    let scene = RwLock::new(scene);
    let mut cycle_count = 0u64;

    let summary = driver
        .run(&mut seq_ctrl, &scene, &mut objectives, |scene, _, report| {
            cycle_count += 1;

            if let Some(ref w) = report.warning {
                debug!("Cycle {}: {}", cycle_count, w);
            }

            match ball.step(cycle_count, scene) {
                Ok(_) => true,
                Err(e) => {
                    log::error!("Could not move the ball: {}", e);
                    false
                }
            }
        })
        .wrap_err("Cycle driver failed")?;

    info!(
        "Ran {} cycles: {} plans, {} segments written, {} overruns",
        summary.cycles, summary.plans, summary.segments_written, summary.overruns
    );
    session::save("cycle_summary.json", summary);
    session::save("seq_ctrl_status.json", seq_ctrl.status().clone());

    // ---- SHUTDOWN ----

    let servo_summary = bot.stop().wrap_err("Servo loop failed")?;
    info!(
        "Servo loop ran {} ticks with {} overruns",
        servo_summary.ticks, servo_summary.overruns
    );

    info!("End of execution");
    session.exit();

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// ------------------------------------------------------------------------------------------------

impl Ball {
    fn new(params: ExecParams) -> Self {
        let c = params.ball_centre;
        Self {
            perlin: Perlin::new(),
            centre: Vector3::new(c[0], c[1], c[2]),
            vel: Vector3::zeros(),
            params,
        }
    }

    /// Advance the ball by one cycle.
    ///
    /// The velocity is redrawn every few cycles from a noise field and the ball is pulled back
    /// towards its centre, so it stays within reach.
    fn step(&mut self, cycle: u64, scene: &mut Scene) -> Result<()> {
        let p = &self.params;

        if p.ball_change_cycles > 0 && cycle % p.ball_change_cycles == 0 {
            let s = cycle as f64 * 0.37;
            self.vel = Vector3::new(
                p.ball_step_m * self.perlin.get([s, 0.5]),
                0.0,
                p.ball_step_m * self.perlin.get([s, 10.5]),
            );
        }
        if p.ball_pause_cycles > 0 && cycle % p.ball_pause_cycles == 0 {
            self.vel = Vector3::zeros();
        }

        let frame = scene
            .frame("ball")
            .ok_or_else(|| eyre!("No ball in the scene"))?;
        let pos = frame.rel_pose.translation.vector + self.vel;
        let pos = self.centre + (pos - self.centre) * 0.95;

        let mut pose = frame.rel_pose;
        pose.translation.vector = pos;
        scene.set_rel_pose("ball", pose)?;

        Ok(())
    }
}
