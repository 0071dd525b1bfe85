//! # Joint state
//!
//! Measured joint state of the manipulator and the buffer the servo loop publishes it into.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A snapshot of the joint positions and velocities at a given control time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    /// Joint positions
    ///
    /// Units: radians (or meters for prismatic joints)
    pub q: DVector<f64>,

    /// Joint velocities, same length as `q`
    pub q_dot: DVector<f64>,

    /// Control time at which the state was measured.
    ///
    /// Units: seconds
    pub time: f64,
}

/// Single-slot buffer holding the latest measured state.
///
/// Written by the servo loop every tick, read by the planning side. Each publish bumps a
/// revision counter so readers can wait for fresh data.
#[derive(Debug, Default)]
pub struct StateBuffer {
    slot: Mutex<Slot>,
    new_state: Condvar,
}

#[derive(Debug, Default)]
struct Slot {
    revision: u64,
    state: Option<JointState>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateBufError {
    #[error("State buffer lock is poisoned")]
    PoisonError,

    #[error("Timed out waiting for a state newer than revision {0}")]
    Timeout(u64),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl JointState {
    pub fn new(q: DVector<f64>, q_dot: DVector<f64>, time: f64) -> Self {
        Self { q, q_dot, time }
    }

    /// A state with zero velocity.
    pub fn at_rest(q: DVector<f64>, time: f64) -> Self {
        let q_dot = DVector::zeros(q.len());
        Self { q, q_dot, time }
    }

    /// Number of degrees of freedom.
    pub fn dof(&self) -> usize {
        self.q.len()
    }
}

impl StateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new state, returning the new revision.
    pub fn publish(&self, state: JointState) -> Result<u64, StateBufError> {
        let revision = {
            let mut slot = self.slot.lock()?;
            slot.revision += 1;
            slot.state = Some(state);
            slot.revision
        };

        self.new_state.notify_all();

        Ok(revision)
    }

    /// Copy of the latest state, or `None` if nothing has been published yet.
    pub fn get(&self) -> Result<Option<JointState>, StateBufError> {
        Ok(self.slot.lock()?.state.clone())
    }

    /// Latest state together with its revision.
    pub fn get_with_revision(&self) -> Result<(u64, Option<JointState>), StateBufError> {
        let slot = self.slot.lock()?;
        Ok((slot.revision, slot.state.clone()))
    }

    pub fn revision(&self) -> Result<u64, StateBufError> {
        Ok(self.slot.lock()?.revision)
    }

    /// Block until a state newer than `revision` has been published.
    pub fn wait_for_revision(
        &self,
        revision: u64,
        timeout: Duration,
    ) -> Result<(u64, JointState), StateBufError> {
        let slot = self.slot.lock()?;

        let (slot, result) = self
            .new_state
            .wait_timeout_while(slot, timeout, |s| s.revision <= revision || s.state.is_none())?;

        if result.timed_out() {
            return Err(StateBufError::Timeout(revision));
        }

        match slot.state {
            Some(ref s) => Ok((slot.revision, s.clone())),
            None => Err(StateBufError::Timeout(revision)),
        }
    }
}

impl<G> From<PoisonError<G>> for StateBufError {
    fn from(_: PoisonError<G>) -> Self {
        Self::PoisonError
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_publish_and_get() {
        let buf = StateBuffer::new();
        assert!(buf.get().unwrap().is_none());

        let s = JointState::at_rest(DVector::from_vec(vec![0.1, 0.2]), 1.5);
        assert_eq!(buf.publish(s.clone()).unwrap(), 1);
        assert_eq!(buf.get().unwrap(), Some(s));
        assert_eq!(buf.revision().unwrap(), 1);
    }

    #[test]
    fn test_wait_for_revision() {
        let buf = Arc::new(StateBuffer::new());
        let writer = buf.clone();

        let jh = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer
                .publish(JointState::at_rest(DVector::from_element(3, 1.0), 0.001))
                .unwrap();
        });

        let (rev, state) = buf.wait_for_revision(0, Duration::from_secs(5)).unwrap();
        jh.join().unwrap();

        assert_eq!(rev, 1);
        assert_eq!(state.dof(), 3);

        assert!(matches!(
            buf.wait_for_revision(1, Duration::from_millis(10)),
            Err(StateBufError::Timeout(1))
        ));
    }
}
