//! Ingestion pipeline.
//!
//! One sequential loop per stream:
//! 1. Pull the next throttled frame from the source
//! 2. Run the pose detector on its InferenceView (restricted, no raw bytes)
//! 3. Record the detection (one store write per sampled frame)
//! 4. Optionally append the skeleton overlay to the local video artifact
//! 5. Periodically enforce the retention policy
//!
//! There is no queue between capture and detection. A frame's pixels are
//! dropped (and zeroed) before the next frame is pulled.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::GackConfig;
use crate::detect::{DetectorBackend, DetectorRegistry};
use crate::ingest::{RtspSource, SourceStats};
use crate::recorder::{DetectionRecorder, RecordOutcome};
#[cfg(feature = "overlay-video")]
use crate::render::OverlayVideoWriter;
use crate::storage::{DetectionStore, RetentionPolicy};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// How often the daemon re-applies the retention policy while ingesting.
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub detections_recorded: u64,
    pub persons_seen: u64,
    pub detector_errors: u64,
    pub frames_skipped: u64,
    pub retention_evicted: u64,
    pub overlay_frames: u64,
    pub source: SourceStats,
}

pub struct IngestPipeline {
    source: RtspSource,
    detector: Arc<Mutex<dyn DetectorBackend>>,
    recorder: DetectionRecorder,
    retention: RetentionPolicy,
    retention_interval: Duration,
    #[cfg(feature = "overlay-video")]
    overlay: Option<OverlayVideoWriter>,
    on_record: Option<Box<dyn FnMut(&RecordOutcome) + Send>>,
    stats: PipelineStats,
}

impl IngestPipeline {
    pub fn new(
        source: RtspSource,
        detector: Arc<Mutex<dyn DetectorBackend>>,
        recorder: DetectionRecorder,
    ) -> Self {
        Self {
            source,
            detector,
            recorder,
            retention: RetentionPolicy::default(),
            retention_interval: Duration::from_secs(60),
            #[cfg(feature = "overlay-video")]
            overlay: None,
            on_record: None,
            stats: PipelineStats::default(),
        }
    }

    /// Assemble the daemon's pipeline from configuration.
    ///
    /// Stream, detector and store problems are returned to the caller. An overlay
    /// video that cannot be created is logged and left out.
    pub fn from_config(
        config: &GackConfig,
        store: Box<dyn DetectionStore>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let registry = DetectorRegistry::from_settings(&config.detector)?;
        let detector = registry
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend available"))?;
        let source = RtspSource::new(config.rtsp_config()?)?.with_shutdown(shutdown);

        if !config.output.save_to_db {
            log::warn!("SAVE_TO_DB is off: detections are computed but not stored");
        }
        let recorder = DetectionRecorder::new(store, config.camera_name.clone())
            .with_persistence(config.output.save_to_db);

        #[allow(unused_mut)]
        let mut pipeline = Self::new(source, detector, recorder)
            .with_retention(config.retention.clone(), RETENTION_INTERVAL);

        #[cfg(feature = "overlay-video")]
        if let Some(path) = &config.output.video {
            match OverlayVideoWriter::create(path, config.output.show_original) {
                Ok(writer) => pipeline = pipeline.with_overlay(writer),
                Err(err) => log::error!("overlay video disabled: {:#}", err),
            }
        }
        #[cfg(not(feature = "overlay-video"))]
        if config.output.video.is_some() {
            log::warn!("overlay video requested but this build lacks the overlay-video feature");
        }

        Ok(pipeline)
    }

    pub fn with_retention(mut self, policy: RetentionPolicy, interval: Duration) -> Self {
        self.retention = policy;
        self.retention_interval = interval;
        self
    }

    #[cfg(feature = "overlay-video")]
    pub fn with_overlay(mut self, writer: OverlayVideoWriter) -> Self {
        self.overlay = Some(writer);
        self
    }

    /// Observe every recorded (or computed) detection, in frame order.
    pub fn on_record<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&RecordOutcome) + Send + 'static,
    {
        self.on_record = Some(Box::new(callback));
        self
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.stats.clone();
        stats.source = self.source.stats();
        stats
    }

    /// Run until shutdown, a fatal source fault, a store fault, or the end of a
    /// finite stream.
    ///
    /// Detector faults and invalid detector output skip the frame. Everything that
    /// ends the loop with an error leaves already-recorded detections intact.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<PipelineStats> {
        {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            log::info!(
                "pipeline: detector={} camera={} source={}",
                detector.name(),
                self.recorder.camera_name(),
                self.source.stats().url
            );
            detector.warm_up().context("detector warm-up failed")?;
        }

        self.apply_retention();
        let mut last_retention = Instant::now();
        let mut last_health_log = Instant::now();

        let result = self.run_loop(shutdown, &mut last_retention, &mut last_health_log);
        self.finish_overlay();

        let stats = self.stats();
        log::info!(
            "pipeline stopped: frames={} recorded={} persons={} detector_errors={} skipped={} reconnects={}",
            stats.frames_processed,
            stats.detections_recorded,
            stats.persons_seen,
            stats.detector_errors,
            stats.frames_skipped,
            stats.source.reconnects
        );
        result.map(|_| stats)
    }

    fn run_loop(
        &mut self,
        shutdown: &AtomicBool,
        last_retention: &mut Instant,
        last_health_log: &mut Instant,
    ) -> Result<()> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("pipeline: shutdown requested");
                return Ok(());
            }

            let Some(frame) = self.source.next_frame().context("frame source failed")? else {
                return Ok(());
            };
            self.stats.frames_processed += 1;

            // Modules receive InferenceView, not the frame itself.
            let view = frame.inference_view();
            let detected = {
                let mut detector = self
                    .detector
                    .lock()
                    .map_err(|_| anyhow!("detector lock poisoned"))?;
                view.run_detector(&mut *detector)
            };
            let persons = match detected {
                Ok(persons) => persons,
                Err(e) => {
                    self.stats.detector_errors += 1;
                    log::warn!("detector failed on frame {}: {:#}", view.frame_number(), e);
                    continue;
                }
            };

            let outcome = match self.recorder.record(view.metadata(), persons) {
                Ok(outcome) => outcome,
                Err(e) if e.is_per_frame() => {
                    self.stats.frames_skipped += 1;
                    log::warn!("frame {} skipped: {}", view.frame_number(), e);
                    continue;
                }
                Err(e) => {
                    if e.is_disk_full() {
                        log::error!("detection store is full; stopping ingestion");
                    }
                    return Err(anyhow!(e));
                }
            };

            if matches!(outcome, RecordOutcome::Persisted(_)) {
                self.stats.detections_recorded += 1;
            }
            self.stats.persons_seen += outcome.persons().len() as u64;
            if !outcome.persons().is_empty() {
                log::debug!(
                    "frame {}: {} person(s)",
                    outcome.frame_number(),
                    outcome.persons().len()
                );
            }

            #[cfg(feature = "overlay-video")]
            self.write_overlay(&frame, outcome.persons());

            if let Some(callback) = self.on_record.as_mut() {
                callback(&outcome);
            }

            if last_retention.elapsed() >= self.retention_interval {
                self.apply_retention();
                *last_retention = Instant::now();
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                let stats = self.source.stats();
                log::info!(
                    "rtsp health={} decoded={} emitted={} dropped={} reconnects={} url={}",
                    self.source.is_healthy(),
                    stats.frames_decoded,
                    stats.frames_emitted,
                    stats.frames_dropped,
                    stats.reconnects,
                    stats.url
                );
                *last_health_log = Instant::now();
            }
        }
    }

    fn apply_retention(&mut self) {
        match self.recorder.enforce_retention(&self.retention) {
            Ok(0) => {}
            Ok(evicted) => {
                self.stats.retention_evicted += evicted as u64;
                log::info!("retention: evicted {} detection(s)", evicted);
            }
            Err(e) => log::warn!("retention enforcement failed: {:#}", e),
        }
    }

    #[cfg(feature = "overlay-video")]
    fn write_overlay(&mut self, frame: &crate::Frame, persons: &[crate::PersonPose]) {
        let Some(writer) = self.overlay.as_mut() else {
            return;
        };
        match writer.write_frame(frame, persons) {
            Ok(()) => self.stats.overlay_frames += 1,
            Err(e) => {
                log::error!("overlay video disabled: {:#}", e);
                self.overlay = None;
            }
        }
    }

    fn finish_overlay(&mut self) {
        #[cfg(feature = "overlay-video")]
        if let Some(writer) = self.overlay.take() {
            let path = writer.path().display().to_string();
            match writer.finish() {
                Ok(n) => log::info!("overlay video: {} frame(s) written to {}", n, path),
                Err(e) => log::error!("overlay video: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{rtsp::RtspConfig, BackoffConfig, SourceError};
    use crate::storage::{DetectionReader, InMemoryDetectionStore};
    use crate::{PersonPose, StubPoseDetector};

    fn source(url: &str, fps: u32) -> RtspSource {
        RtspSource::new(RtspConfig {
            url: url.to_string(),
            target_fps: fps,
            reconnect: BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
            stall_timeout: Duration::from_secs(1),
        })
        .expect("stub source")
    }

    fn stub_detector() -> Arc<Mutex<dyn DetectorBackend>> {
        Arc::new(Mutex::new(StubPoseDetector::new()))
    }

    /// Fails on every other call.
    struct Flaky {
        calls: u64,
    }

    impl DetectorBackend for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn detect(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<Vec<PersonPose>> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                Err(anyhow!("model hiccup"))
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[test]
    fn records_every_sampled_frame() -> Result<()> {
        let store = InMemoryDetectionStore::new();
        let recorder = DetectionRecorder::new(Box::new(store.clone()), "cam");
        let mut pipeline = IngestPipeline::new(
            source("stub://cam?paced=false&frames=120&native_fps=30&width=32&height=24", 10),
            stub_detector(),
            recorder,
        );

        let stats = pipeline.run(&AtomicBool::new(false))?;
        assert_eq!(stats.frames_processed, 40);
        assert_eq!(stats.detections_recorded, 40);
        // Sampled frames 1, 4, .., 118. Frames 1..=50 and 101..=150 are bright.
        assert_eq!(stats.persons_seen, 17 + 6);

        let rows = store.get_latest(100)?;
        assert_eq!(rows.len(), 40);
        let mut numbers: Vec<u64> = rows.iter().map(|d| d.frame_number).collect();
        numbers.reverse();
        assert!(numbers.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[test]
    fn detector_faults_skip_frames() -> Result<()> {
        let store = InMemoryDetectionStore::new();
        let recorder = DetectionRecorder::new(Box::new(store.clone()), "cam");
        let mut pipeline = IngestPipeline::new(
            source("stub://cam?paced=false&frames=10&width=8&height=8", 30),
            Arc::new(Mutex::new(Flaky { calls: 0 })),
            recorder,
        );

        let stats = pipeline.run(&AtomicBool::new(false))?;
        assert_eq!(stats.frames_processed, 10);
        assert_eq!(stats.detector_errors, 5);
        assert_eq!(store.stats()?.total_count, 5);
        Ok(())
    }

    #[test]
    fn fatal_source_error_stops_pipeline() {
        let store = InMemoryDetectionStore::new();
        let recorder = DetectionRecorder::new(Box::new(store), "cam");
        let mut pipeline =
            IngestPipeline::new(source("stub://cam?fail=unauthorized", 1), stub_detector(), recorder);

        let err = pipeline
            .run(&AtomicBool::new(false))
            .expect_err("unauthorized");
        assert!(matches!(
            err.downcast_ref::<SourceError>(),
            Some(SourceError::Unauthorized(_))
        ));
    }

    #[test]
    fn shutdown_flag_stops_before_next_frame() -> Result<()> {
        let store = InMemoryDetectionStore::new();
        let recorder = DetectionRecorder::new(Box::new(store.clone()), "cam");
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let mut pipeline = IngestPipeline::new(
            source("stub://cam?paced=false&width=8&height=8", 30),
            stub_detector(),
            recorder,
        )
        .on_record(move |outcome| {
            if outcome.frame_number() >= 3 {
                flag.store(true, Ordering::SeqCst);
            }
        });

        let stats = pipeline.run(&shutdown)?;
        assert_eq!(stats.detections_recorded, 3);
        assert_eq!(store.stats()?.total_count, 3);
        Ok(())
    }

    #[test]
    fn unsaved_mode_computes_without_writing() -> Result<()> {
        let store = InMemoryDetectionStore::new();
        let recorder =
            DetectionRecorder::new(Box::new(store.clone()), "cam").with_persistence(false);
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let mut pipeline = IngestPipeline::new(
            source("stub://cam?paced=false&frames=6&scene=bright&width=16&height=16", 30),
            stub_detector(),
            recorder,
        )
        .on_record(move |outcome| {
            if let Ok(mut n) = counter.lock() {
                *n += outcome.persons().len();
            }
        });

        let stats = pipeline.run(&AtomicBool::new(false))?;
        assert_eq!(stats.frames_processed, 6);
        assert_eq!(stats.detections_recorded, 0);
        assert_eq!(*seen.lock().map_err(|_| anyhow!("poisoned"))?, 6);
        assert_eq!(store.stats()?.total_count, 0);
        Ok(())
    }
}
