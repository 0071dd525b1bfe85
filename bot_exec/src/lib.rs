//! # Bot library.
//!
//! Receding-horizon control for a manipulator. A slow planning side (waypoint and timing
//! planners, coordinated by the sequence controller and run by the cycle driver) continuously
//! rewrites a shared reference spline, which a fast servo loop tracks on its own thread.
//!
//! The executable in this crate uses the library to follow a moving target with an emulated
//! gantry.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Bot operator - blocking scripted motions directly on the reference buffer
pub mod bot;

/// Cycle driver - runs the sequence controller at the planning rate
pub mod cycle;

/// Measured joint state and the buffer the servo loop publishes it through
pub mod joint_state;

/// Motion capture - filtered rigid body poses pulled into the scene
pub mod mocap;

/// Reference buffer - the spline or hold reference shared between planning and the servo loop
pub mod ref_buf;

/// Scene model - joints and named frames
pub mod scene;

/// Sequence controller - decides when to re-plan and what to commit to the reference
pub mod seq_ctrl;

/// Servo loop - tracks the reference at the actuator rate
pub mod servo;

/// Cubic Hermite splines over control time
pub mod spline;

/// Timing planner - times the remaining waypoints under velocity and acceleration bounds
pub mod timing_mpc;

/// Waypoint planner - finds untimed waypoints satisfying the objectives
pub mod waypoint_mpc;
