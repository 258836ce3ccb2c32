//! Skeleton overlay video.
//!
//! Draws keypoints and limbs for each detected person onto a black canvas, or
//! onto the original frame when requested, and appends the result to a
//! Motion-JPEG file. This is a local artifact only; nothing here touches the
//! detection store.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use crate::frame::Frame;
use crate::{PersonPose, SKELETON_EDGES};

pub const KEYPOINT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const LIMB_COLOR: Rgb<u8> = Rgb([0, 0, 255]);

/// Keypoints below this confidence are not drawn, nor are limbs touching them.
pub const MIN_KEYPOINT_CONFIDENCE: f32 = 0.5;

const KEYPOINT_RADIUS: i32 = 4;
const JPEG_QUALITY: u8 = 80;

/// Draw every person's skeleton onto `canvas`.
pub fn draw_skeletons(canvas: &mut RgbImage, persons: &[PersonPose]) {
    for person in persons {
        for (a, b) in SKELETON_EDGES {
            let (pa, ca) = person.keypoint(a);
            let (pb, cb) = person.keypoint(b);
            if ca < MIN_KEYPOINT_CONFIDENCE || cb < MIN_KEYPOINT_CONFIDENCE {
                continue;
            }
            draw_line_segment_mut(canvas, (pa.x, pa.y), (pb.x, pb.y), LIMB_COLOR);
        }
        for (point, confidence) in person.keypoints.iter().zip(person.keypoint_confidences) {
            if confidence < MIN_KEYPOINT_CONFIDENCE {
                continue;
            }
            draw_filled_circle_mut(
                canvas,
                (point.x.round() as i32, point.y.round() as i32),
                KEYPOINT_RADIUS,
                KEYPOINT_COLOR,
            );
        }
    }
}

/// Build the overlay image for one frame.
pub fn render_overlay(frame: &Frame, persons: &[PersonPose], show_original: bool) -> Result<RgbImage> {
    let mut canvas = if show_original {
        RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?
    } else {
        RgbImage::new(frame.width, frame.height)
    };
    draw_skeletons(&mut canvas, persons);
    Ok(canvas)
}

/// Appends overlay frames to a Motion-JPEG file (concatenated JPEG images).
pub struct OverlayVideoWriter {
    out: BufWriter<File>,
    path: PathBuf,
    show_original: bool,
    frames_written: u64,
}

impl OverlayVideoWriter {
    pub fn create<P: AsRef<Path>>(path: P, show_original: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create overlay directory {}", parent.display()))?;
            }
        }
        let file = File::create(&path)
            .with_context(|| format!("create overlay video {}", path.display()))?;
        log::info!("overlay video: writing {}", path.display());
        Ok(Self {
            out: BufWriter::new(file),
            path,
            show_original,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn write_frame(&mut self, frame: &Frame, persons: &[PersonPose]) -> Result<()> {
        let canvas = render_overlay(frame, persons, self.show_original)?;
        let encoded = JpegEncoder::new_with_quality(&mut self.out, JPEG_QUALITY)
            .encode_image(&canvas)
            .context("encode overlay frame");
        let mut raw = canvas.into_raw();
        raw.zeroize();
        encoded?;
        self.frames_written += 1;
        Ok(())
    }

    /// Flush and close; returns the number of frames written.
    pub fn finish(mut self) -> Result<u64> {
        self.out
            .flush()
            .with_context(|| format!("flush overlay video {}", self.path.display()))?;
        Ok(self.frames_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, StubPoseDetector};
    use std::time::Duration;

    fn bright_frame(width: u32, height: u32) -> Frame {
        Frame::new(
            vec![200u8; (width * height * 3) as usize],
            width,
            height,
            1,
            Duration::ZERO,
            crate::capture_timestamp(),
        )
        .expect("frame")
    }

    #[test]
    fn black_canvas_only_has_skeleton_colors() -> Result<()> {
        let frame = bright_frame(120, 90);
        let persons = StubPoseDetector::new().detect(frame.pixels(), 120, 90)?;
        let image = render_overlay(&frame, &persons, false)?;

        let mut saw_keypoint = false;
        let mut saw_limb = false;
        for pixel in image.pixels() {
            match *pixel {
                p if p == KEYPOINT_COLOR => saw_keypoint = true,
                p if p == LIMB_COLOR => saw_limb = true,
                Rgb([0, 0, 0]) => {}
                other => panic!("unexpected pixel {:?}", other),
            }
        }
        assert!(saw_keypoint);
        assert!(saw_limb);
        Ok(())
    }

    #[test]
    fn low_confidence_keypoints_are_skipped() -> Result<()> {
        let frame = bright_frame(120, 90);
        let mut persons = StubPoseDetector::new().detect(frame.pixels(), 120, 90)?;
        persons[0].keypoint_confidences = [0.1; crate::KEYPOINT_COUNT];
        let image = render_overlay(&frame, &persons, false)?;
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
        Ok(())
    }

    #[test]
    fn show_original_keeps_background() -> Result<()> {
        let frame = bright_frame(32, 24);
        let image = render_overlay(&frame, &[], true)?;
        assert!(image.pixels().all(|p| *p == Rgb([200, 200, 200])));
        Ok(())
    }

    #[test]
    fn writer_appends_jpeg_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out").join("overlay.mjpeg");
        let mut writer = OverlayVideoWriter::create(&path, false)?;
        let frame = bright_frame(64, 48);
        writer.write_frame(&frame, &[])?;
        writer.write_frame(&frame, &[])?;
        assert_eq!(writer.finish()?, 2);

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let starts = bytes.windows(3).filter(|w| *w == [0xFF, 0xD8, 0xFF]).count();
        assert_eq!(starts, 2);
        Ok(())
    }
}
