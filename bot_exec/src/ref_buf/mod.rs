//! # Reference buffer
//!
//! The reference buffer is the single source of truth for what the robot should currently be
//! doing. It holds either a motion reference (a cubic spline over control time) or a hold
//! reference, together with the control law the servo loop should apply.
//!
//! The servo loop reads it every tick while the cycle driver overwrites it every cycle. Reads copy
//! an `Arc` to the current snapshot under a short read lock and evaluate it outside the lock, so a
//! slow writer never stalls the servo. Every write builds a complete new snapshot and swaps it in
//! at once, so a reader sees either the old reference or the new one and never a mix.
//!
//! Smooth override splices new knots onto the current spline at a given time. The spline is left
//! unchanged up to that time and position and velocity stay continuous across it.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod buffer;
mod reference;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use buffer::*;
pub use reference::*;
