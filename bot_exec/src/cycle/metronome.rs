//! Drift-correcting periodic timer

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{
    convert::TryFrom,
    thread,
    time::{Duration, Instant},
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Smallest period a metronome can be created with.
const MIN_PERIOD: Duration = Duration::from_micros(1);

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Periodic timer ticking on fixed boundaries.
///
/// Boundaries are computed from the start instant rather than from the end of the previous tick,
/// so sleep jitter doesn't accumulate. If a tick is late the boundaries already passed are skipped
/// and the tick waits for the next future boundary, so ticks never run back-to-back.
#[derive(Debug)]
pub struct Metronome {
    period: Duration,
    start: Instant,
    next: Instant,
    ticks: u64,
    skipped: u64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Metronome {
    pub fn new(period: Duration) -> Self {
        let period = period.max(MIN_PERIOD);
        let start = Instant::now();
        Self {
            period,
            start,
            next: start + period,
            ticks: 0,
            skipped: 0,
        }
    }

    /// Create a metronome with a period given in seconds.
    pub fn from_secs_f64(period_s: f64) -> Self {
        Self::new(Duration::from_secs_f64(period_s.max(0.0)))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Total number of boundaries skipped because of late ticks.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Time since the metronome was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Block until the next tick.
    ///
    /// Returns the number of boundaries that were skipped, zero when on time.
    pub fn wait_for_tick(&mut self) -> u64 {
        let now = Instant::now();
        let mut skipped = 0;

        if now >= self.next {
            // Every boundary up to and including now has been missed
            let behind = now - self.next;
            skipped = (behind.as_nanos() / self.period.as_nanos()) as u64 + 1;
            self.next += self.period * u32::try_from(skipped).unwrap_or(u32::MAX);
        }

        if let Some(wait) = self.next.checked_duration_since(now) {
            thread::sleep(wait);
        }

        self.next += self.period;
        self.ticks += 1;
        self.skipped += skipped;

        skipped
    }
}
