//! Frame isolation layer.
//!
//! Pixels exist only between capture and the end of inference for that frame.
//!
//! - `Frame`: opaque container for decoded RGB pixels. Bytes are private.
//! - `InferenceView`: restricted view handed to pose detectors. Can run inference,
//!   cannot export bytes.
//!
//! There is no public path from a `Frame` to its pixels. The overlay renderer, the
//! only other in-crate consumer, reads them through a crate-private accessor.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use zeroize::Zeroize;

use crate::detect::DetectorBackend;
use crate::PersonPose;

/// Opaque decoded frame. There is no `Clone`, no `Serialize`, no `AsRef<[u8]>`.
///
/// Pixel bytes are private:
///
/// ```compile_fail
/// fn leak(frame: &gack::Frame) -> Vec<u8> {
///     frame.data.clone()
/// }
/// ```
///
/// and frames cannot be duplicated:
///
/// ```compile_fail
/// fn keep(frame: &gack::Frame) -> gack::Frame {
///     frame.clone()
/// }
/// ```
pub struct Frame {
    /// RGB24, row-major, no padding. MUST NOT be exposed via any public API.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Native frame index since the stream session started (1-based).
    pub frame_number: u64,

    /// Offset from the start of the stream session.
    pub video_timestamp: Duration,

    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Create a new frame. Called only by the ingestion layer.
    pub(crate) fn new(
        mut data: Vec<u8>,
        width: u32,
        height: u32,
        frame_number: u64,
        video_timestamp: Duration,
        captured_at: DateTime<Utc>,
    ) -> Result<Self> {
        check_rgb_buffer(&mut data, width, height)?;
        Ok(Self {
            data,
            width,
            height,
            frame_number,
            video_timestamp,
            captured_at,
        })
    }

    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata {
            frame_number: self.frame_number,
            video_timestamp: self.video_timestamp,
            captured_at: self.captured_at,
        }
    }

    /// Detectors get a restricted view. Cannot extract bytes.
    pub fn inference_view(&self) -> InferenceView<'_> {
        InferenceView { frame: self }
    }

    pub(crate) fn pixels(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Zeroize pixel data on drop to limit the exposure window.
        self.data.zeroize();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frame_number", &self.frame_number)
            .field("video_timestamp", &self.video_timestamp)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

/// Everything about a frame that outlives its pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameMetadata {
    pub frame_number: u64,
    pub video_timestamp: Duration,
    pub captured_at: DateTime<Utc>,
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

/// Reject a buffer that is not exactly `width * height` RGB24 pixels.
/// A rejected buffer is zeroized before the error is returned.
pub(crate) fn check_rgb_buffer(data: &mut Vec<u8>, width: u32, height: u32) -> Result<()> {
    let expected = match rgb_len(width, height) {
        Ok(n) => n,
        Err(e) => {
            data.zeroize();
            return Err(e);
        }
    };
    if data.len() != expected {
        let received = data.len();
        data.zeroize();
        return Err(anyhow!(
            "frame {}x{} expects {} RGB bytes, received {}",
            width,
            height,
            expected,
            received
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// InferenceView: restricted interface for detectors
// ----------------------------------------------------------------------------

/// Restricted view of a frame for inference.
///
/// Provides dimensions and capture metadata, and the ability to run a detector
/// (which receives pixels internally). Does NOT provide byte access or cloning.
///
/// ```compile_fail
/// fn export(view: &gack::InferenceView<'_>) -> String {
///     serde_json::to_string(view).unwrap()
/// }
/// ```
pub struct InferenceView<'a> {
    frame: &'a Frame,
}

impl<'a> InferenceView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn frame_number(&self) -> u64 {
        self.frame.frame_number
    }

    pub fn video_timestamp(&self) -> Duration {
        self.frame.video_timestamp
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.frame.captured_at
    }

    pub fn metadata(&self) -> FrameMetadata {
        self.frame.metadata()
    }

    /// Run a pose detector on this frame.
    ///
    /// Pixels flow in as a borrowed slice; only poses flow out.
    pub fn run_detector(&self, detector: &mut dyn DetectorBackend) -> Result<Vec<PersonPose>> {
        detector.detect(&self.frame.data, self.frame.width, self.frame.height)
    }
}
