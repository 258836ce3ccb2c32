//! gack - privacy-preserving home monitoring
//!
//! This crate turns a live RTSP camera stream into a history of skeletal keypoints.
//! Video pixels are used for inference and then dropped; only pose keypoints,
//! confidences and bounding boxes are ever persisted.
//!
//! # Architecture
//!
//! Frame Source -> Pose Detector -> Detection Recorder -> Detection Store <- Replay API
//!
//! The ingestion side is a single sequential loop per stream. The replay API only
//! ever receives read handles to the store and cannot mutate it.
//!
//! # Module Structure
//!
//! - `frame`: frame isolation (Frame, InferenceView)
//! - `ingest`: frame sources (RTSP, synthetic), throttling, reconnect backoff
//! - `detect`: pose detector capability and backends
//! - `recorder`: detector output + frame metadata -> detection records
//! - `storage`: detection store (SQLite, in-memory)
//! - `pipeline`: the ingestion loop
//! - `api`: read-only replay API
//! - `config`: file + environment configuration
//! - `ui`: terminal progress for the admin tool
//! - `render`: skeleton overlay video (feature: overlay-video)
//! - Core types: Keypoint, PersonPose, CandidateDetection, Detection, PoseContract

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod recorder;
#[cfg(feature = "overlay-video")]
pub mod render;
pub mod storage;
pub mod ui;

pub use api::{ApiConfig, ApiHandle, ApiServer, QueryError, ReaderFactory};
pub use config::GackConfig;
pub use detect::{DetectorBackend, DetectorRegistry, StubPoseDetector};
pub use frame::{Frame, FrameMetadata, InferenceView};
pub use ingest::{rtsp::RtspConfig, BackoffConfig, FrameThrottle, RtspSource, SourceError};
pub use pipeline::{IngestPipeline, PipelineStats};
pub use recorder::{DetectionRecorder, RecordError, RecordOutcome};
pub use storage::{
    shared_memory_uri, DetectionReader, DetectionStats, DetectionStore, InMemoryDetectionStore,
    RangeFilter, RetentionPolicy, SqliteDetectionReader, SqliteDetectionStore, TimelineEntry,
};

// -------------------- Keypoints --------------------

/// Number of anatomical landmarks per person (COCO layout).
pub const KEYPOINT_COUNT: usize = 17;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointKind {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointKind {
    pub const ALL: [KeypointKind; KEYPOINT_COUNT] = [
        Self::Nose,
        Self::LeftEye,
        Self::RightEye,
        Self::LeftEar,
        Self::RightEar,
        Self::LeftShoulder,
        Self::RightShoulder,
        Self::LeftElbow,
        Self::RightElbow,
        Self::LeftWrist,
        Self::RightWrist,
        Self::LeftHip,
        Self::RightHip,
        Self::LeftKnee,
        Self::RightKnee,
        Self::LeftAnkle,
        Self::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Limb segments drawn by the overlay renderer, as keypoint index pairs.
pub const SKELETON_EDGES: [(KeypointKind, KeypointKind); 12] = [
    (KeypointKind::LeftShoulder, KeypointKind::LeftElbow),
    (KeypointKind::LeftElbow, KeypointKind::LeftWrist),
    (KeypointKind::RightShoulder, KeypointKind::RightElbow),
    (KeypointKind::RightElbow, KeypointKind::RightWrist),
    (KeypointKind::LeftShoulder, KeypointKind::RightShoulder),
    (KeypointKind::LeftShoulder, KeypointKind::LeftHip),
    (KeypointKind::RightShoulder, KeypointKind::RightHip),
    (KeypointKind::LeftHip, KeypointKind::RightHip),
    (KeypointKind::LeftHip, KeypointKind::LeftKnee),
    (KeypointKind::LeftKnee, KeypointKind::LeftAnkle),
    (KeypointKind::RightHip, KeypointKind::RightKnee),
    (KeypointKind::RightKnee, KeypointKind::RightAnkle),
];

/// A landmark position in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn area(&self) -> f32 {
        (self.x_max - self.x_min).max(0.0) * (self.y_max - self.y_min).max(0.0)
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x_max.min(other.x_max) - self.x_min.max(other.x_min)).max(0.0);
        let iy = (self.y_max.min(other.y_max) - self.y_min.max(other.y_min)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detected person within a frame.
///
/// Keypoints and their confidences are fixed-size arrays, so the two sequences
/// can never disagree in length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonPose {
    pub keypoints: [Keypoint; KEYPOINT_COUNT],
    pub keypoint_confidences: [f32; KEYPOINT_COUNT],
    pub detection_confidence: f32,
    pub bounding_box: BoundingBox,
}

impl PersonPose {
    pub fn keypoint(&self, kind: KeypointKind) -> (Keypoint, f32) {
        let i = kind.index();
        (self.keypoints[i], self.keypoint_confidences[i])
    }
}

// -------------------- Detections --------------------

/// A detection before the store has assigned it an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateDetection {
    pub timestamp: DateTime<Utc>,
    pub frame_number: u64,
    /// Seconds since the stream session started.
    pub video_timestamp: f64,
    pub camera_name: String,
    pub persons: Vec<PersonPose>,
}

/// A persisted detection. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub frame_number: u64,
    pub video_timestamp: f64,
    pub camera_name: String,
    pub persons: Vec<PersonPose>,
}

impl Detection {
    pub fn from_candidate(id: i64, candidate: CandidateDetection) -> Self {
        Self {
            id,
            timestamp: candidate.timestamp,
            frame_number: candidate.frame_number,
            video_timestamp: candidate.video_timestamp,
            camera_name: candidate.camera_name,
            persons: candidate.persons,
        }
    }

    pub fn person_count(&self) -> usize {
        self.persons.len()
    }

    /// Drop the id, yielding the fields that were originally inserted.
    pub fn into_candidate(self) -> CandidateDetection {
        CandidateDetection {
            timestamp: self.timestamp,
            frame_number: self.frame_number,
            video_timestamp: self.video_timestamp,
            camera_name: self.camera_name,
            persons: self.persons,
        }
    }
}

// -------------------- Pose Contract --------------------

/// Shape checks applied to detector output before anything is recorded.
pub struct PoseContract;

impl PoseContract {
    pub fn check_pose(pose: &PersonPose) -> Result<()> {
        if !unit_interval(pose.detection_confidence) {
            return Err(anyhow!(
                "pose contract: detection confidence {} outside [0,1]",
                pose.detection_confidence
            ));
        }
        if let Some(c) = pose
            .keypoint_confidences
            .iter()
            .find(|c| !unit_interval(**c))
        {
            return Err(anyhow!(
                "pose contract: keypoint confidence {} outside [0,1]",
                c
            ));
        }
        if pose
            .keypoints
            .iter()
            .any(|k| !k.x.is_finite() || !k.y.is_finite())
        {
            return Err(anyhow!("pose contract: non-finite keypoint coordinate"));
        }
        let b = &pose.bounding_box;
        if ![b.x_min, b.y_min, b.x_max, b.y_max]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(anyhow!("pose contract: non-finite bounding box"));
        }
        if b.x_min > b.x_max || b.y_min > b.y_max {
            return Err(anyhow!("pose contract: inverted bounding box"));
        }
        Ok(())
    }

    pub fn check_candidate(candidate: &CandidateDetection) -> Result<()> {
        if !candidate.video_timestamp.is_finite() || candidate.video_timestamp < 0.0 {
            return Err(anyhow!(
                "pose contract: video timestamp must be a non-negative number of seconds"
            ));
        }
        if candidate.camera_name.trim().is_empty() {
            return Err(anyhow!("pose contract: camera name must not be empty"));
        }
        for pose in &candidate.persons {
            Self::check_pose(pose)?;
        }
        Ok(())
    }
}

fn unit_interval(v: f32) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

// -------------------- Timestamps --------------------

/// Wall-clock capture time at the precision the store keeps (microseconds).
pub fn capture_timestamp() -> DateTime<Utc> {
    let now = Utc::now();
    micros_to_timestamp(now.timestamp_micros()).unwrap_or(now)
}

pub fn micros_to_timestamp(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp {} out of range", micros))
}

/// Parse an RFC 3339 timestamp, or a naive ISO 8601 one interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(anyhow!(
        "invalid timestamp '{}': use ISO format (YYYY-MM-DDTHH:MM:SS)",
        raw
    ))
}

// -------------------- Tests --------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_pose(offset: f32) -> PersonPose {
        let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
        for (i, k) in keypoints.iter_mut().enumerate() {
            *k = Keypoint::new(100.0 + offset + i as f32, 200.0 + i as f32 * 2.5);
        }
        PersonPose {
            keypoints,
            keypoint_confidences: [0.8; KEYPOINT_COUNT],
            detection_confidence: 0.9,
            bounding_box: BoundingBox::new(50.0 + offset, 100.0, 200.0 + offset, 300.0),
        }
    }

    pub(crate) fn candidate_at(secs: i64, frame_number: u64, persons: usize) -> CandidateDetection {
        CandidateDetection {
            timestamp: Utc.timestamp_opt(secs, 0).single().expect("valid timestamp"),
            frame_number,
            video_timestamp: frame_number as f64 * 0.5,
            camera_name: "test_camera".to_string(),
            persons: (0..persons).map(|i| sample_pose(i as f32 * 10.0)).collect(),
        }
    }

    #[test]
    fn keypoint_kind_index_round_trips() {
        for (i, kind) in KeypointKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert_eq!(KeypointKind::from_index(i), Some(*kind));
        }
        assert_eq!(KeypointKind::from_index(KEYPOINT_COUNT), None);
    }

    #[test]
    fn pose_contract_accepts_sample() -> Result<()> {
        PoseContract::check_pose(&sample_pose(0.0))?;
        PoseContract::check_candidate(&candidate_at(1_700_000_000, 1, 2))?;
        Ok(())
    }

    #[test]
    fn pose_contract_rejects_out_of_range_confidence() {
        let mut pose = sample_pose(0.0);
        pose.keypoint_confidences[3] = 1.5;
        assert!(PoseContract::check_pose(&pose).is_err());

        let mut pose = sample_pose(0.0);
        pose.detection_confidence = f32::NAN;
        assert!(PoseContract::check_pose(&pose).is_err());
    }

    #[test]
    fn pose_contract_rejects_inverted_box() {
        let mut pose = sample_pose(0.0);
        pose.bounding_box = BoundingBox::new(10.0, 10.0, 5.0, 20.0);
        assert!(PoseContract::check_pose(&pose).is_err());
    }

    #[test]
    fn bounding_box_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn parse_timestamp_accepts_rfc3339_and_naive() -> Result<()> {
        let a = parse_timestamp("2024-05-01T12:30:00Z")?;
        let b = parse_timestamp("2024-05-01T12:30:00")?;
        let c = parse_timestamp("2024-05-01T14:30:00+02:00")?;
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(parse_timestamp("yesterday").is_err());
        Ok(())
    }

    #[test]
    fn capture_timestamp_survives_micro_round_trip() -> Result<()> {
        let ts = capture_timestamp();
        assert_eq!(micros_to_timestamp(ts.timestamp_micros())?, ts);
        Ok(())
    }
}
