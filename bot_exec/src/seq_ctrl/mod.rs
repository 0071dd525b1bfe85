//! # Sequence controller
//!
//! The sequence controller ties the waypoint and timing planners together and decides what goes
//! into the reference buffer each cycle. It moves between three modes:
//!
//! - `Idle`: no feasible plan has been found yet.
//! - `Planned`: a feasible plan is held but none of its timings has been committed.
//! - `Committed`: a timed segment of the held plan was handed out for writing.
//!
//! Every cycle the [`ReplanPolicy`] decides whether the waypoints are re-solved. Whether or not
//! they are, the remaining waypoints are re-timed from the splice point `ctrl_time + tau_cutoff`,
//! starting from the reference's own position and velocity there. The reference before the
//! splice point is frozen, so it never changes once committed.
//!
//! An infeasible waypoint solve or a failed timing solve is not fatal: the cycle produces no
//! segment, the held plan, the mode and the previous reference stay in place and a warning is
//! raised in the status report. Plans are never modified, timing a plan replaces it with a copy
//! carrying the durations.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod params;
mod policy;
mod state;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use params::Params;
pub use policy::*;
pub use state::*;
