//! Threaded servo loop

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, trace, warn};

use super::{Params, Servo, ServoError};
use crate::cycle::Metronome;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Starts the servo loop on its own thread.
pub struct ServoLoop;

/// Handle to a running servo loop.
///
/// Dropping the handle stops and joins the loop.
pub struct ServoHandle {
    stop: Arc<AtomicBool>,
    jh: Option<JoinHandle<Result<ServoSummary, ServoError>>>,
}

/// Statistics returned when the loop exits.
#[derive(Debug, Clone, Default)]
pub struct ServoSummary {
    pub ticks: u64,

    /// Number of ticks that started late
    pub overruns: u64,

    pub exit_reason: ExitReason,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The stop flag was raised
    Stopped,

    /// Control time passed the end of the motion reference
    SplineEnd,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for ExitReason {
    fn default() -> Self {
        Self::Stopped
    }
}

impl ServoLoop {
    /// Spawn the servo thread.
    pub fn start(servo: Servo, params: &Params) -> Result<ServoHandle, ServoError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let params = params.clone();

        let jh = thread::Builder::new()
            .name("servo".into())
            .spawn(move || run(servo, params, stop_clone))
            .map_err(ServoError::SpawnError)?;

        Ok(ServoHandle {
            stop,
            jh: Some(jh),
        })
    }
}

impl ServoHandle {
    /// Shared stop flag, raising it stops the loop at the next tick.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// True while the servo thread is still running.
    pub fn is_running(&self) -> bool {
        match self.jh {
            Some(ref jh) => !jh.is_finished(),
            None => false,
        }
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Returns the loop's summary, or the error that terminated it.
    pub fn stop(mut self) -> Result<ServoSummary, ServoError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<ServoSummary, ServoError> {
        self.stop.store(true, Ordering::Relaxed);

        match self.jh.take() {
            Some(jh) => jh.join().map_err(|_| ServoError::ThreadPanicked)?,
            None => Ok(ServoSummary::default()),
        }
    }
}

impl Drop for ServoHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Servo loop exited with an error: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn run(
    mut servo: Servo,
    params: Params,
    stop: Arc<AtomicBool>,
) -> Result<ServoSummary, ServoError> {
    info!("Servo loop started at {:.1} Hz", 1.0 / params.tau_s);

    let mut metronome = Metronome::from_secs_f64(params.tau_s);
    let mut summary = ServoSummary::default();

    while !stop.load(Ordering::Relaxed) {
        let tick = match servo.step() {
            Ok(t) => t,
            Err(e) => {
                warn!("Servo loop terminated after {} ticks: {}", summary.ticks, e);
                return Err(e);
            }
        };
        summary.ticks += 1;

        if params.stop_on_spline_end && tick.past_spline_end {
            debug!("Control time {:.3} s is past the spline end", tick.state.time);
            summary.exit_reason = ExitReason::SplineEnd;
            break;
        }

        if params.report_every_ticks > 0 && summary.ticks % params.report_every_ticks == 0 {
            debug!(
                "Servo: {} ticks, {} overruns, t = {:.3} s",
                summary.ticks, summary.overruns, tick.state.time
            );
        }

        let skipped = metronome.wait_for_tick();
        if skipped > 0 {
            summary.overruns += 1;
            trace!("Servo tick {} overran, skipped {} periods", summary.ticks, skipped);
        }
    }

    info!(
        "Servo loop stopped ({:?}) after {} ticks with {} overruns",
        summary.exit_reason, summary.ticks, summary.overruns
    );

    Ok(summary)
}
