use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::{BoundingBox, Keypoint, PersonPose, KEYPOINT_COUNT};

/// Canonical standing skeleton, normalised to its bounding box (COCO order).
const CANONICAL_POSE: [(f32, f32); KEYPOINT_COUNT] = [
    (0.50, 0.08),
    (0.54, 0.06),
    (0.46, 0.06),
    (0.58, 0.08),
    (0.42, 0.08),
    (0.68, 0.22),
    (0.32, 0.22),
    (0.76, 0.40),
    (0.24, 0.40),
    (0.80, 0.56),
    (0.20, 0.56),
    (0.62, 0.55),
    (0.38, 0.55),
    (0.63, 0.76),
    (0.37, 0.76),
    (0.64, 0.96),
    (0.36, 0.96),
];

const BRIGHTNESS_THRESHOLD: u64 = 128;
const SAMPLE_STRIDE: usize = 97;

/// Stub backend for testing and for `stub://` streams.
///
/// Deterministic: reports one canonical skeleton centred in the frame when the
/// sampled mean brightness is above mid-grey, and nobody otherwise.
#[derive(Debug, Default)]
pub struct StubPoseDetector;

impl StubPoseDetector {
    pub fn new() -> Self {
        Self
    }

    fn canonical_person(width: u32, height: u32) -> PersonPose {
        let (w, h) = (width as f32, height as f32);
        let bounding_box = BoundingBox::new(w / 3.0, h * 0.1, w * 2.0 / 3.0, h * 0.9);
        let box_w = bounding_box.x_max - bounding_box.x_min;
        let box_h = bounding_box.y_max - bounding_box.y_min;

        let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
        for (k, (nx, ny)) in keypoints.iter_mut().zip(CANONICAL_POSE) {
            *k = Keypoint::new(
                bounding_box.x_min + nx * box_w,
                bounding_box.y_min + ny * box_h,
            );
        }

        PersonPose {
            keypoints,
            keypoint_confidences: [0.85; KEYPOINT_COUNT],
            detection_confidence: 0.9,
            bounding_box,
        }
    }
}

impl DetectorBackend for StubPoseDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<PersonPose>> {
        if pixels.is_empty() || width == 0 || height == 0 {
            return Err(anyhow!("stub detector received an empty frame"));
        }

        let (sum, count) = pixels
            .iter()
            .step_by(SAMPLE_STRIDE)
            .fold((0u64, 0u64), |(s, n), &p| (s + p as u64, n + 1));
        let mean = sum / count.max(1);

        if mean > BRIGHTNESS_THRESHOLD {
            Ok(vec![Self::canonical_person(width, height)])
        } else {
            Ok(Vec::new())
        }
    }
}
