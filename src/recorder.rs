//! Detection recorder.
//!
//! Turns detector output plus frame metadata into a detection and hands it to
//! the store. One write per sampled frame, including frames with nobody in them.
//! With persistence disabled the same path runs and the write is skipped.

use anyhow::anyhow;
use std::time::Duration;

use crate::frame::FrameMetadata;
use crate::ingest::{Backoff, BackoffConfig};
use crate::storage::{self, DetectionStore, RetentionPolicy};
use crate::{CandidateDetection, Detection, PersonPose, PoseContract};

const DEFAULT_WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The frame counter went backwards or repeated within the session.
    #[error("frame {frame_number} does not follow previously recorded frame {last}")]
    OutOfOrder { frame_number: u64, last: u64 },
    /// Detector output failed validation; the frame is skipped.
    #[error("invalid detector output: {0}")]
    InvalidPose(String),
    #[error("detection store write failed: {0:#}")]
    Store(anyhow::Error),
}

impl RecordError {
    /// Per-frame faults skip the frame; store faults stop ingestion.
    pub fn is_per_frame(&self) -> bool {
        !matches!(self, Self::Store(_))
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::Store(e) if storage::is_disk_full(e))
    }
}

/// What happened to a sampled frame's detection.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordOutcome {
    Persisted(Detection),
    /// Persistence is disabled; the detection was built but not written.
    Computed(CandidateDetection),
}

impl RecordOutcome {
    pub fn persons(&self) -> &[PersonPose] {
        match self {
            Self::Persisted(d) => &d.persons,
            Self::Computed(c) => &c.persons,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Persisted(d) => Some(d.id),
            Self::Computed(_) => None,
        }
    }

    pub fn frame_number(&self) -> u64 {
        match self {
            Self::Persisted(d) => d.frame_number,
            Self::Computed(c) => c.frame_number,
        }
    }
}

pub struct DetectionRecorder {
    store: Box<dyn DetectionStore>,
    camera_name: String,
    persist: bool,
    write_attempts: u32,
    retry: BackoffConfig,
    last_frame_number: Option<u64>,
    persisted: u64,
}

impl DetectionRecorder {
    pub fn new(store: Box<dyn DetectionStore>, camera_name: impl Into<String>) -> Self {
        Self {
            store,
            camera_name: camera_name.into(),
            persist: true,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            retry: BackoffConfig {
                initial: Duration::from_millis(50),
                max: Duration::from_secs(1),
            },
            last_frame_number: None,
            persisted: 0,
        }
    }

    /// `SAVE_TO_DB`: when false every write becomes a no-op.
    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_write_retry(mut self, attempts: u32, retry: BackoffConfig) -> Self {
        self.write_attempts = attempts.max(1);
        self.retry = retry;
        self
    }

    pub fn camera_name(&self) -> &str {
        &self.camera_name
    }

    pub fn persisted_count(&self) -> u64 {
        self.persisted
    }

    pub fn record(
        &mut self,
        metadata: FrameMetadata,
        persons: Vec<PersonPose>,
    ) -> Result<RecordOutcome, RecordError> {
        if let Some(last) = self.last_frame_number {
            if metadata.frame_number <= last {
                return Err(RecordError::OutOfOrder {
                    frame_number: metadata.frame_number,
                    last,
                });
            }
        }

        let candidate = CandidateDetection {
            timestamp: metadata.captured_at,
            frame_number: metadata.frame_number,
            video_timestamp: metadata.video_timestamp.as_secs_f64(),
            camera_name: self.camera_name.clone(),
            persons,
        };
        PoseContract::check_candidate(&candidate)
            .map_err(|e| RecordError::InvalidPose(e.to_string()))?;

        if !self.persist {
            self.last_frame_number = Some(candidate.frame_number);
            return Ok(RecordOutcome::Computed(candidate));
        }

        let id = self.insert_with_retry(&candidate)?;
        self.last_frame_number = Some(candidate.frame_number);
        self.persisted += 1;
        log::debug!(
            "recorded detection {} (frame {}, {} persons)",
            id,
            candidate.frame_number,
            candidate.persons.len()
        );
        Ok(RecordOutcome::Persisted(Detection::from_candidate(
            id, candidate,
        )))
    }

    /// Apply a retention policy through the recorder's store handle.
    pub fn enforce_retention(&mut self, policy: &RetentionPolicy) -> anyhow::Result<usize> {
        if !self.persist || policy.is_unbounded() {
            return Ok(0);
        }
        self.store.enforce_retention(policy, chrono::Utc::now())
    }

    fn insert_with_retry(&mut self, candidate: &CandidateDetection) -> Result<i64, RecordError> {
        let mut backoff = Backoff::new(self.retry.clone());
        let mut attempt = 1;
        loop {
            match self.store.insert(candidate) {
                Ok(id) => return Ok(id),
                Err(e) if storage::is_transient(&e) && attempt < self.write_attempts => {
                    let delay = backoff.next_delay();
                    log::warn!(
                        "detection store busy (attempt {}/{}), retrying in {:?}",
                        attempt,
                        self.write_attempts,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) if storage::is_transient(&e) => {
                    return Err(RecordError::Store(anyhow!(
                        "store still busy after {} attempts: {:#}",
                        attempt,
                        e
                    )))
                }
                Err(e) => return Err(RecordError::Store(e)),
            }
        }
    }
}
