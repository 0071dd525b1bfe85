//! # Motion capture
//!
//! Rigid body poses from a motion capture system are received on a background thread, low pass
//! filtered, and pulled into the [`Scene`] by the cycle driver. All bodies are attached as
//! children of a `mocap_base` frame, whose pose in the world is the calibrated pose of the
//! capture system's origin.
//!
//! The capture system itself is abstracted by [`MocapSource`]. [`ChannelSource`] is provided for
//! sources that deliver frames from another thread, such as a network receiver.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod filter;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use nalgebra::Isometry3;

use crate::scene::{Scene, SceneError};

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use filter::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Name of the frame all rigid bodies are attached to.
pub const MOCAP_BASE: &str = "mocap_base";

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// A motion capture system.
pub trait MocapSource: Send {
    /// Wait for the next frame of rigid bodies.
    ///
    /// `Ok(None)` means no frame arrived within the source's own wait period, the caller will try
    /// again. [`MocapError::Disconnected`] ends the stream.
    fn next_frame(&mut self) -> Result<Option<Vec<RigidBody>>, MocapError>;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Filtered poses of every rigid body seen so far, relative to the capture system's origin.
pub struct PoseStream {
    base_pose: Option<Isometry3<f64>>,
    alpha: f64,
    poses: Mutex<BTreeMap<String, Isometry3<f64>>>,
    num_frames: AtomicU64,
}

/// Handle to the background receiving thread. Dropping it stops the thread.
pub struct MocapHandle {
    stream: Arc<PoseStream>,
    stop: Arc<AtomicBool>,
    jh: Option<JoinHandle<Result<(), MocapError>>>,
}

/// Source fed through a channel.
pub struct ChannelSource {
    rx: Receiver<Vec<RigidBody>>,
    timeout: Duration,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MocapError {
    #[error("Motion capture source failed: {0}")]
    Source(String),

    #[error("Motion capture source disconnected")]
    Disconnected,

    #[error("Could not update the scene: {0}")]
    Scene(#[from] SceneError),

    #[error("Body \"{0}\" has the name of a scene frame not attached to the motion capture base")]
    FrameCollision(String),

    #[error("Pose store lock is poisoned")]
    PoisonError,

    #[error("Could not spawn the receiving thread: {0}")]
    SpawnError(std::io::Error),

    #[error("The receiving thread panicked")]
    ThreadPanicked,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl PoseStream {
    /// New empty stream. `base_pose` is the world pose of the capture system's origin.
    pub fn new(base_pose: Option<Isometry3<f64>>) -> Self {
        Self {
            base_pose,
            alpha: FILTER_ALPHA,
            poses: Mutex::new(BTreeMap::new()),
            num_frames: AtomicU64::new(0),
        }
    }

    /// Use a different filter weight, 1.0 disables filtering.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.max(0.0).min(1.0);
        self
    }

    /// Start receiving frames from `source` on a background thread.
    pub fn start(
        mut source: Box<dyn MocapSource>,
        base_pose: Option<Isometry3<f64>>,
    ) -> Result<MocapHandle, MocapError> {
        let stream = Arc::new(PoseStream::new(base_pose));
        let stop = Arc::new(AtomicBool::new(false));

        let stream_clone = stream.clone();
        let stop_clone = stop.clone();

        let jh = thread::Builder::new()
            .name("mocap".into())
            .spawn(move || {
                info!("Motion capture thread started");
                while !stop_clone.load(Ordering::Relaxed) {
                    match source.next_frame() {
                        Ok(Some(frame)) => stream_clone.update(&frame)?,
                        Ok(None) => (),
                        Err(MocapError::Disconnected) => {
                            info!("Motion capture source disconnected");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                info!(
                    "Motion capture thread stopped after {} frames",
                    stream_clone.num_frames()
                );
                Ok(())
            })
            .map_err(MocapError::SpawnError)?;

        Ok(MocapHandle {
            stream,
            stop,
            jh: Some(jh),
        })
    }

    /// Filter a new frame into the stored poses.
    ///
    /// Occluded bodies keep their last pose. A body seen for the first time takes its measured
    /// pose directly.
    pub fn update(&self, frame: &[RigidBody]) -> Result<(), MocapError> {
        let mut poses = self.poses.lock()?;

        for body in frame.iter().filter(|b| !b.occluded) {
            let signal = body.pose();
            match poses.get_mut(&body.name) {
                Some(pose) => pose_filter(pose, self.alpha, &signal),
                None => {
                    debug!("New rigid body \"{}\"", body.name);
                    poses.insert(body.name.clone(), signal);
                }
            }
        }

        self.num_frames.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Copy of the current filtered poses.
    pub fn poses(&self) -> Result<BTreeMap<String, Isometry3<f64>>, MocapError> {
        Ok(self.poses.lock()?.clone())
    }

    /// Number of frames received so far.
    pub fn num_frames(&self) -> u64 {
        self.num_frames.load(Ordering::Relaxed)
    }

    /// Write the filtered poses into the scene.
    ///
    /// Creates the base frame and a child frame per body the first time they are needed, which
    /// bumps the scene's structure version. Nothing is written if a body is named after a frame
    /// that isn't a child of the base.
    pub fn pull(&self, scene: &mut Scene) -> Result<(), MocapError> {
        if !scene.has_frame(MOCAP_BASE) {
            let base = match self.base_pose {
                Some(p) => p,
                None => {
                    warn!(
                        "No calibrated pose for the motion capture origin, placing \"{}\" at the \
                        world origin",
                        MOCAP_BASE
                    );
                    Isometry3::identity()
                }
            };
            scene.add_frame(MOCAP_BASE, None, base)?;
        }

        let poses = self.poses()?;

        let collision = poses.keys().find(|name| match scene.frame(name) {
            Some(f) => f.parent.as_deref() != Some(MOCAP_BASE),
            None => false,
        });
        if let Some(name) = collision {
            return Err(MocapError::FrameCollision(name.clone()));
        }

        for (name, pose) in poses {
            if scene.has_frame(&name) {
                scene.set_rel_pose(&name, pose)?;
            } else {
                scene.add_frame(&name, Some(MOCAP_BASE), pose)?;
            }
        }

        Ok(())
    }
}

impl<G> From<PoisonError<G>> for MocapError {
    fn from(_: PoisonError<G>) -> Self {
        Self::PoisonError
    }
}

impl MocapHandle {
    pub fn stream(&self) -> Arc<PoseStream> {
        self.stream.clone()
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) -> Result<(), MocapError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), MocapError> {
        self.stop.store(true, Ordering::Relaxed);

        match self.jh.take() {
            Some(jh) => jh.join().map_err(|_| MocapError::ThreadPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for MocapHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Motion capture thread exited with an error: {}", e);
        }
    }
}

impl ChannelSource {
    /// Create the source and the sender used to feed it.
    ///
    /// `timeout` bounds how long [`MocapSource::next_frame`] blocks, and so how quickly the
    /// receiving thread notices it has been stopped.
    pub fn new(timeout: Duration) -> (Sender<Vec<RigidBody>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx, timeout })
    }
}

impl MocapSource for ChannelSource {
    fn next_frame(&mut self) -> Result<Option<Vec<RigidBody>>, MocapError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(MocapError::Disconnected),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn body(name: &str, x: f64, occluded: bool) -> RigidBody {
        RigidBody {
            occluded,
            ..RigidBody::new(name, Vector3::new(x, 0.0, 0.0), UnitQuaternion::identity())
        }
    }

    #[test]
    fn test_update_filters_and_skips_occluded() {
        let stream = PoseStream::new(None);

        // Occluded bodies are never initialised
        stream.update(&[body("ball", 1.0, false), body("cube", 5.0, true)]).unwrap();
        let poses = stream.poses().unwrap();
        assert_eq!(poses.len(), 1);
        assert!((poses["ball"].translation.x - 1.0).abs() < 1e-12);

        stream.update(&[body("ball", 2.0, false)]).unwrap();
        assert!((stream.poses().unwrap()["ball"].translation.x - 1.1).abs() < 1e-12);

        // Occlusion keeps the last estimate
        stream.update(&[body("ball", 10.0, true)]).unwrap();
        assert!((stream.poses().unwrap()["ball"].translation.x - 1.1).abs() < 1e-12);
        assert_eq!(stream.num_frames(), 3);
    }

    #[test]
    fn test_pull_into_scene() {
        let base = Isometry3::translation(0.0, 0.0, 1.0);
        let stream = PoseStream::new(Some(base));
        let mut scene = Scene::new(&["x", "y", "z"]);

        stream.update(&[body("ball", 0.5, false)]).unwrap();
        stream.pull(&mut scene).unwrap();

        assert_eq!(scene.structure_version(), 2);
        assert_eq!(scene.frame("ball").unwrap().parent.as_deref(), Some(MOCAP_BASE));
        assert!((scene.position("ball").unwrap() - Vector3::new(0.5, 0.0, 1.0)).norm() < 1e-12);

        // Subsequent pulls only move frames
        stream.update(&[body("ball", 1.5, false)]).unwrap();
        stream.pull(&mut scene).unwrap();
        assert_eq!(scene.structure_version(), 2);
        assert!((scene.position("ball").unwrap().x - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_pull_rejects_scene_frame_names() {
        let stream = PoseStream::new(Some(Isometry3::translation(0.0, 0.0, 1.0)));
        let mut scene = Scene::new(&["x", "y", "z"]);
        scene
            .add_frame("table", None, Isometry3::translation(0.3, 0.0, 0.0))
            .unwrap();

        stream
            .update(&[body("ball", 0.5, false), body("table", 2.0, false)])
            .unwrap();

        assert!(matches!(
            stream.pull(&mut scene),
            Err(MocapError::FrameCollision(ref name)) if name == "table"
        ));

        // The table stays where it was and the ball wasn't added either
        assert_eq!(scene.frame("table").unwrap().parent, None);
        assert!((scene.position("table").unwrap().x - 0.3).abs() < 1e-12);
        assert!(!scene.has_frame("ball"));
    }

    #[test]
    fn test_channel_thread() {
        let (tx, source) = ChannelSource::new(Duration::from_millis(5));
        let handle = PoseStream::start(Box::new(source), None).unwrap();
        let stream = handle.stream();

        tx.send(vec![body("ball", 1.0, false)]).unwrap();
        tx.send(vec![body("ball", 1.0, false)]).unwrap();

        for _ in 0..200 {
            if stream.num_frames() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(stream.num_frames(), 2);

        handle.stop().unwrap();
    }
}
