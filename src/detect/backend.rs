use anyhow::Result;

use crate::PersonPose;

/// Pose detector backend trait.
///
/// # Audit Boundary
///
/// This trait defines an AUDIT BOUNDARY, not a security boundary.
/// Implementations MUST be manually audited to ensure they:
/// - Do not store raw pixels beyond the `detect` call
/// - Do not write to disk
/// - Do not make network requests
///
/// For a given frame and model version the output must be the same on every call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run pose detection on an RGB24 frame.
    ///
    /// Returns the detected persons in model order (possibly empty). An error is a
    /// per-frame fault; the caller skips the frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<PersonPose>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
