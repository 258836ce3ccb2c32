//! Pose detection capability.
//!
//! The pose model is an external capability: given a frame it returns zero or more
//! `PersonPose`s. Everything downstream depends only on `DetectorBackend`, so tests
//! can substitute deterministic fakes without loading a model.

mod backend;
mod backends;
mod registry;

pub use backend::DetectorBackend;
pub use backends::StubPoseDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractPoseBackend;
pub use registry::{DetectorRegistry, DetectorSettings};
