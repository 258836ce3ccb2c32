#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::{BoundingBox, Keypoint, PersonPose, KEYPOINT_COUNT};

type PosePlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Values per anchor in a YOLOv8-pose head: box (4) + score (1) + 17 x (x, y, conf).
const ROW_LEN: usize = 5 + 3 * KEYPOINT_COUNT;

/// Decoding parameters for a YOLOv8-pose output head.
#[derive(Clone, Debug)]
struct PoseHead {
    input_size: u32,
    confidence_threshold: f32,
    /// Keypoints below this confidence are reported as (0, 0) with confidence 0.
    keypoint_threshold: f32,
    iou_threshold: f32,
}

impl PoseHead {
    fn new(input_size: u32) -> Self {
        Self {
            input_size,
            confidence_threshold: 0.5,
            keypoint_threshold: 0.55,
            iou_threshold: 0.45,
        }
    }

    /// Decode a `[1, 56, anchors]` head into frame-pixel poses, then suppress overlaps.
    fn decode(&self, output: &Tensor, width: u32, height: u32) -> Result<Vec<PersonPose>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("pose head output must be rank 3")?;
        let shape = view.shape();
        if shape[1] != ROW_LEN {
            return Err(anyhow!(
                "pose head output has {} rows per anchor, expected {}",
                shape[1],
                ROW_LEN
            ));
        }

        // The input is stretched to a square, so each axis scales independently.
        let sx = width as f32 / self.input_size as f32;
        let sy = height as f32 / self.input_size as f32;
        let (fw, fh) = (width as f32, height as f32);

        let mut candidates = Vec::new();
        for i in 0..shape[2] {
            let score = view[[0, 4, i]];
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            let (cx, cy) = (view[[0, 0, i]] * sx, view[[0, 1, i]] * sy);
            let (bw, bh) = (view[[0, 2, i]] * sx, view[[0, 3, i]] * sy);
            let bounding_box = BoundingBox::new(
                clamp_finite(cx - bw / 2.0, fw),
                clamp_finite(cy - bh / 2.0, fh),
                clamp_finite(cx + bw / 2.0, fw),
                clamp_finite(cy + bh / 2.0, fh),
            );

            let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
            let mut keypoint_confidences = [0.0f32; KEYPOINT_COUNT];
            for k in 0..KEYPOINT_COUNT {
                let row = 5 + 3 * k;
                let conf = finite_unit(view[[0, row + 2, i]]);
                if conf < self.keypoint_threshold {
                    continue;
                }
                keypoints[k] = Keypoint::new(
                    clamp_finite(view[[0, row, i]] * sx, fw),
                    clamp_finite(view[[0, row + 1, i]] * sy, fh),
                );
                keypoint_confidences[k] = conf;
            }

            candidates.push(PersonPose {
                keypoints,
                keypoint_confidences,
                detection_confidence: finite_unit(score),
                bounding_box,
            });
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Tract-based backend for YOLOv8-pose ONNX models.
///
/// Loads a local model file and runs inference on RGB frames. Frames are resized
/// (nearest neighbour) to the square model input and coordinates are mapped back
/// to frame pixels. No network I/O, no disk writes beyond model loading.
pub struct TractPoseBackend {
    model: PosePlan,
    head: PoseHead,
}

impl TractPoseBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            head: PoseHead::new(input_size),
        })
    }

    /// Override the default person confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.head.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let expected_len = crate::frame::rgb_len(width, height)?;
        if pixels.len() != expected_len || expected_len == 0 {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let side = self.head.input_size as usize;
        let (w, h) = (width as usize, height as usize);
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let sy = (y * h / side).min(h - 1);
            let sx = (x * w / side).min(w - 1);
            pixels[(sy * w + sx) * 3 + c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }
}

impl DetectorBackend for TractPoseBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<PersonPose>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.head.decode(output, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.head.input_size;
        let blank = vec![0u8; crate::frame::rgb_len(side, side)?];
        self.detect(&blank, side, side).map(|_| ())
    }
}

fn clamp_finite(v: f32, max: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, max)
    } else {
        0.0
    }
}

fn finite_unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Greedy NMS, highest confidence first. Output keeps confidence order.
fn non_max_suppression(mut poses: Vec<PersonPose>, iou_threshold: f32) -> Vec<PersonPose> {
    poses.sort_by(|a, b| b.detection_confidence.total_cmp(&a.detection_confidence));
    let mut kept: Vec<PersonPose> = Vec::with_capacity(poses.len());
    for pose in poses {
        if kept
            .iter()
            .all(|k| k.bounding_box.iou(&pose.bounding_box) <= iou_threshold)
        {
            kept.push(pose);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One anchor column per entry: (cx, cy, w, h, score, keypoint confidence).
    fn head_output(anchors: &[(f32, f32, f32, f32, f32, f32)]) -> Tensor {
        tract_ndarray::Array3::from_shape_fn((1, ROW_LEN, anchors.len()), |(_, row, i)| {
            let (cx, cy, w, h, score, kconf) = anchors[i];
            match row {
                0 => cx,
                1 => cy,
                2 => w,
                3 => h,
                4 => score,
                r if (r - 5) % 3 == 0 => cx,
                r if (r - 5) % 3 == 1 => cy,
                _ => kconf,
            }
        })
        .into_tensor()
    }

    #[test]
    fn decodes_into_frame_pixels() -> Result<()> {
        let head = PoseHead::new(640);
        let output = head_output(&[(320.0, 320.0, 100.0, 200.0, 0.9, 0.8)]);
        let poses = head.decode(&output, 1280, 720)?;
        assert_eq!(poses.len(), 1);

        let pose = &poses[0];
        let b = &pose.bounding_box;
        assert!((b.x_min - 540.0).abs() < 1e-3 && (b.x_max - 740.0).abs() < 1e-3);
        assert!((b.y_min - 247.5).abs() < 1e-3 && (b.y_max - 472.5).abs() < 1e-3);
        assert!((pose.keypoints[0].x - 640.0).abs() < 1e-3);
        assert!((pose.keypoints[0].y - 360.0).abs() < 1e-3);
        assert!((pose.keypoint_confidences[16] - 0.8).abs() < 1e-6);
        crate::PoseContract::check_pose(pose)
    }

    #[test]
    fn drops_weak_scores_and_keypoints() -> Result<()> {
        let head = PoseHead::new(640);
        let output = head_output(&[
            (100.0, 100.0, 50.0, 50.0, 0.2, 0.9),
            (400.0, 400.0, 50.0, 50.0, 0.7, 0.3),
        ]);
        let poses = head.decode(&output, 640, 640)?;
        assert_eq!(poses.len(), 1);
        assert!(poses[0].keypoint_confidences.iter().all(|c| *c == 0.0));
        assert_eq!(poses[0].keypoints[5], Keypoint::default());
        Ok(())
    }

    #[test]
    fn suppresses_overlapping_people() -> Result<()> {
        let head = PoseHead::new(640);
        let output = head_output(&[
            (200.0, 200.0, 100.0, 100.0, 0.6, 0.9),
            (202.0, 200.0, 100.0, 100.0, 0.8, 0.9),
            (500.0, 500.0, 80.0, 80.0, 0.7, 0.9),
        ]);
        let poses = head.decode(&output, 640, 640)?;
        let scores: Vec<f32> = poses.iter().map(|p| p.detection_confidence).collect();
        assert_eq!(scores, vec![0.8, 0.7]);
        Ok(())
    }

    #[test]
    fn rejects_unexpected_head_shape() {
        let head = PoseHead::new(640);
        let output = tract_ndarray::Array3::<f32>::zeros((1, 10, 4)).into_tensor();
        assert!(head.decode(&output, 640, 640).is_err());
    }
}
