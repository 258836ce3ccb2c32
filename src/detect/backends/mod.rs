pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubPoseDetector;

#[cfg(feature = "backend-tract")]
pub use tract::TractPoseBackend;
